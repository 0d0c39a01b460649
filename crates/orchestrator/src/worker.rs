//! Pool of tokio tasks draining the durable work queue.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::ExecutionEngine;

#[derive(Clone)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkerPool {
    /// Spawns `workers` loops. Must be called inside a tokio runtime.
    pub fn start(engine: ExecutionEngine, workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        let handles = (0..workers.max(1))
            .map(|n| {
                let worker_id = format!("worker-{}-{n}", &prefix[..8]);
                tokio::spawn(run_worker(engine.clone(), worker_id, shutdown.subscribe()))
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "Worker pool started");

        Self {
            shutdown,
            workers: Arc::new(Mutex::new(handles)),
        }
    }

    /// Stops the loops after their current item and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let _ = worker.await;
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(engine: ExecutionEngine, worker_id: String, mut shutdown: watch::Receiver<bool>) {
    let idle = engine.context().config.poll_interval();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let worked = match engine.process_next(&worker_id).await {
            Ok(worked) => worked,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Worker iteration failed");
                false
            }
        };
        if worked {
            continue;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!(worker_id = %worker_id, "Worker stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::EngineContext;
    use conductor_core::{Plan, PlanNode, PlanStatus};
    use db::{create_memory_pool, run_migrations, ExecutionStore};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_runs_plan_to_completion() {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let config = EngineConfig::default().with_poll_interval(Duration::from_millis(5));
        let engine =
            ExecutionEngine::new(Arc::new(EngineContext::new(ExecutionStore::new(pool), config)));

        let plan = Plan::new("pair", "a")
            .with_node(PlanNode::new("a", "a", "noop").with_next("b"))
            .with_node(PlanNode::new("b", "b", "noop").with_parameters(json!({"outputs": 7})));
        let execution = engine.start_plan(plan, HashMap::new()).await.unwrap();

        let workers = WorkerPool::start(engine.clone(), 2);
        let mut status = PlanStatus::Running;
        for _ in 0..400 {
            status = engine.store().plans().get(execution.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        workers.shutdown().await;
        assert_eq!(status, PlanStatus::Succeeded);
    }
}
