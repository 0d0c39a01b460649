//! Periodic expiry of overdue nodes and purge of retained plans.

use chrono::{DateTime, Utc};
use conductor_core::to_chrono;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::ExecutionEngine;
use crate::error::Result;

const PLANS_PER_SWEEP: i64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub plans_checked: usize,
    pub nodes_expired: usize,
    pub plans_purged: u64,
}

pub struct ExpirySweeper {
    engine: ExecutionEngine,
}

impl ExpirySweeper {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self { engine }
    }

    /// Expires overdue nodes of every plan whose iteration is due, then purges
    /// ended plans past retention.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let store = self.engine.store();
        let interval = to_chrono(self.engine.context().config.iteration_interval());
        let plans = store
            .plans()
            .claim_due_for_iteration(now, interval, PLANS_PER_SWEEP)
            .await?;

        let interrupts = self.engine.interrupts();
        let mut report = SweepReport {
            plans_checked: plans.len(),
            ..SweepReport::default()
        };
        for plan in &plans {
            for node in store.nodes().find_expired(plan.id, now).await? {
                match interrupts.expire(node.id, now).await {
                    Ok(result) if result.is_applied() => {
                        info!(
                            plan_execution_id = %plan.id,
                            node_execution_id = %node.id,
                            identifier = %node.identifier,
                            "Node expired"
                        );
                        report.nodes_expired += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(node_execution_id = %node.id, error = %e, "Expiry failed");
                    }
                }
            }
        }
        report.plans_purged = store.plans().purge_expired(now).await?;

        if report.nodes_expired > 0 || report.plans_purged > 0 {
            info!(
                plans_checked = report.plans_checked,
                nodes_expired = report.nodes_expired,
                plans_purged = report.plans_purged,
                "Sweep finished"
            );
        } else {
            debug!(plans_checked = report.plans_checked, "Sweep found nothing");
        }
        Ok(report)
    }

    /// Sweeps every iteration interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.engine.context().config.iteration_interval();
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.sweep_once(Utc::now()).await {
                    error!(error = %e, "Sweep failed");
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!("Expiry sweeper stopping");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::EngineContext;
    use conductor_core::{FacilitationMode, Plan, PlanNode, PlanStatus, Status};
    use db::{create_memory_pool, run_migrations, ExecutionStore};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweep_expires_overdue_node_and_purges() {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let config = EngineConfig::default()
            .with_iteration_interval(Duration::from_secs(1))
            .with_plan_retention(Duration::from_secs(60));
        let engine =
            ExecutionEngine::new(Arc::new(EngineContext::new(ExecutionStore::new(pool), config)));

        let plan = Plan::new("slow", "w").with_node(
            PlanNode::new("w", "w", "wait")
                .with_facilitation(FacilitationMode::Async)
                .with_timeout_secs(5),
        );
        let execution = engine.start_plan(plan, HashMap::new()).await.unwrap();
        engine.run_until_idle("test").await.unwrap();

        let sweeper = ExpirySweeper::new(engine.clone());
        let early = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(early.nodes_expired, 0);

        let later = Utc::now() + chrono::Duration::seconds(10);
        let report = sweeper.sweep_once(later).await.unwrap();
        assert_eq!(report.plans_checked, 1);
        assert_eq!(report.nodes_expired, 1);

        let nodes = engine.store().nodes().find_by_plan(execution.id).await.unwrap();
        assert_eq!(nodes[0].status, Status::Expired);
        let stored = engine.store().plans().get(execution.id).await.unwrap();
        assert_eq!(stored.status, PlanStatus::Expired);

        let far = Utc::now() + chrono::Duration::days(1);
        let report = sweeper.sweep_once(far).await.unwrap();
        assert_eq!(report.plans_purged, 1);
        assert!(engine.store().plans().find_by_id(execution.id).await.unwrap().is_none());
    }
}
