//! Interrupts: operator and system requests that bypass the advisers.
//!
//! Node interrupts are recorded as an [`InterruptEffect`] on the node before
//! the status transition is attempted, in their own commit. Re-applying a
//! request after a crash between the two finds the recorded effect and
//! finishes the transition without appending a second one. Plan interrupts
//! are tracked in the `interrupts` table.

use chrono::{DateTime, Utc};
use conductor_core::{
    to_chrono, Interrupt, InterruptEffect, InterruptState, InterruptType, NodeExecution,
    PlanStatus, Status, WorkItem,
};
use db::UnitOfWork;
use events::Event;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::ExecutionEngine;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum InterruptTarget {
    Node(Uuid),
    Plan(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRequest {
    /// Deduplication key; delivering the same request twice applies it once.
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub target: InterruptTarget,
}

impl InterruptRequest {
    pub fn new(interrupt_type: InterruptType, target: InterruptTarget) -> Self {
        Self {
            interrupt_id: Uuid::new_v4(),
            interrupt_type,
            target,
        }
    }

    pub fn node(interrupt_type: InterruptType, node_execution_id: Uuid) -> Self {
        Self::new(interrupt_type, InterruptTarget::Node(node_execution_id))
    }

    pub fn plan(interrupt_type: InterruptType, plan_execution_id: Uuid) -> Self {
        Self::new(interrupt_type, InterruptTarget::Plan(plan_execution_id))
    }

    pub fn with_id(mut self, interrupt_id: Uuid) -> Self {
        self.interrupt_id = interrupt_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptResult {
    /// Effects appended by this request. Empty for plan pause/resume.
    Applied(Vec<InterruptEffect>),
    AlreadyApplied,
    AlreadyTerminal,
    /// Expiry requested before the node's deadline.
    NotDue,
}

impl InterruptResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

pub struct InterruptManager {
    engine: ExecutionEngine,
}

impl InterruptManager {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self { engine }
    }

    /// Applies an operator interrupt. `EXPIRE` is reserved for the sweeper.
    pub async fn apply(&self, request: InterruptRequest) -> Result<InterruptResult> {
        if !request.interrupt_type.is_user_issuable() {
            return Err(OrchestratorError::invalid_interrupt(format!(
                "{} is issued by the engine only",
                request.interrupt_type
            )));
        }
        self.dispatch(&request, Utc::now()).await
    }

    /// Expires a node whose `expiry_at` is at or before `now`; earlier calls
    /// return [`InterruptResult::NotDue`].
    pub async fn expire(&self, node_execution_id: Uuid, now: DateTime<Utc>) -> Result<InterruptResult> {
        self.dispatch(&InterruptRequest::node(InterruptType::Expire, node_execution_id), now)
            .await
    }

    async fn dispatch(&self, request: &InterruptRequest, now: DateTime<Utc>) -> Result<InterruptResult> {
        let result = match (request.interrupt_type, request.target) {
            (InterruptType::AbortAll, InterruptTarget::Node(_)) => {
                return Err(OrchestratorError::invalid_interrupt(
                    "abort_all targets a plan execution",
                ))
            }
            (_, InterruptTarget::Node(node_id)) => self.apply_to_node(request, node_id, now).await?,
            (InterruptType::Pause, InterruptTarget::Plan(plan_id)) => {
                self.toggle_plan(request, plan_id, PlanStatus::Running, PlanStatus::Paused)
                    .await?
            }
            (InterruptType::Resume, InterruptTarget::Plan(plan_id)) => {
                self.toggle_plan(request, plan_id, PlanStatus::Paused, PlanStatus::Running)
                    .await?
            }
            (InterruptType::AbortAll, InterruptTarget::Plan(plan_id)) => {
                self.abort_all(request, plan_id).await?
            }
            (other, InterruptTarget::Plan(_)) => {
                return Err(OrchestratorError::invalid_interrupt(format!(
                    "{other} targets a node execution"
                )))
            }
        };

        match &result {
            InterruptResult::Applied(effects) => info!(
                interrupt_id = %request.interrupt_id,
                interrupt_type = %request.interrupt_type,
                target = ?request.target,
                effects = effects.len(),
                "Interrupt applied"
            ),
            other => debug!(
                interrupt_id = %request.interrupt_id,
                interrupt_type = %request.interrupt_type,
                result = ?other,
                "Interrupt had no effect"
            ),
        }
        Ok(result)
    }

    async fn apply_to_node(
        &self,
        request: &InterruptRequest,
        node_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<InterruptResult> {
        let retries = self.engine.context().config.max_conflict_retries;
        for _ in 0..=retries {
            match self.try_apply_to_node(request, node_id, now).await {
                Err(e) if e.is_conflict() => {
                    warn!(node_execution_id = %node_id, interrupt_id = %request.interrupt_id, "Conflict while interrupting node, re-reading");
                }
                other => return other,
            }
        }
        Err(OrchestratorError::ConcurrentModification { id: node_id })
    }

    async fn try_apply_to_node(
        &self,
        request: &InterruptRequest,
        node_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<InterruptResult> {
        let mut node = self.engine.store().nodes().get(node_id).await?;
        let kind = request.interrupt_type;
        let pending = pending_effect(&node, kind);

        if let Some(seen) = node
            .interrupt_history
            .iter()
            .find(|e| e.interrupt_id == request.interrupt_id)
        {
            if pending.as_ref() != Some(seen) {
                return Ok(InterruptResult::AlreadyApplied);
            }
        }
        if node.is_terminal() {
            return Ok(InterruptResult::AlreadyTerminal);
        }
        if kind == InterruptType::Expire
            && pending.is_none()
            && node.expiry_at.map_or(true, |at| at > now)
        {
            return Ok(InterruptResult::NotDue);
        }

        let target = match kind {
            InterruptType::Abort => Status::Aborted,
            InterruptType::Expire => Status::Expired,
            InterruptType::Pause => match node.status {
                Status::Suspended => return Ok(InterruptResult::AlreadyApplied),
                Status::Queued => {
                    return Err(OrchestratorError::invalid_interrupt(
                        "a queued node cannot be paused",
                    ))
                }
                _ => Status::Suspended,
            },
            InterruptType::Resume => {
                if node.status != Status::Suspended {
                    return Ok(InterruptResult::AlreadyApplied);
                }
                Status::Running
            }
            InterruptType::Retry => Status::Running,
            InterruptType::AbortAll => {
                return Err(OrchestratorError::invalid_interrupt(
                    "abort_all targets a plan execution",
                ))
            }
        };

        let effect = match pending {
            Some(effect) => {
                debug!(node_execution_id = %node.id, interrupt_id = %effect.interrupt_id, "Completing recorded interrupt");
                effect
            }
            None => {
                let effect = InterruptEffect::new(
                    request.interrupt_id,
                    kind,
                    node.attempt_id,
                    node.status,
                    target,
                );
                self.persist_effect(&mut node, effect.clone()).await?;
                effect
            }
        };

        let plan_execution_id = node.plan_execution_id;
        let effects = match kind {
            InterruptType::Abort | InterruptType::Expire => self.force_end(node, &effect).await?,
            InterruptType::Pause | InterruptType::Resume => {
                self.toggle_node(node, target).await?;
                vec![effect.clone()]
            }
            InterruptType::Retry => self.restart_node(node, &effect).await?,
            InterruptType::AbortAll => Vec::new(),
        };

        self.engine.context().emit_event(Event::InterruptApplied {
            plan_execution_id,
            node_execution_id: Some(node_id),
            interrupt_id: effect.interrupt_id,
            interrupt_type: kind,
        });
        Ok(InterruptResult::Applied(effects))
    }

    async fn persist_effect(&self, node: &mut NodeExecution, effect: InterruptEffect) -> Result<()> {
        node.interrupt_history.push(effect);
        let mut uow = UnitOfWork::new();
        uow.update_node(node, node.status);
        self.engine.store().commit(uow).await?;
        node.version += 1;
        Ok(())
    }

    /// ABORT / EXPIRE: ends the node and everything still running beneath it,
    /// then closes its chain.
    async fn force_end(
        &self,
        mut node: NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<Vec<InterruptEffect>> {
        let ctx = self.engine.context();
        let now = Utc::now();
        let descendants = self.engine.unfinished_descendants(&node).await?;

        let expected = node.status;
        let from = ctx.transition(&mut node, effect.to_status)?;
        node.ended_at = Some(now);

        let mut uow = UnitOfWork::new();
        uow.update_node(&node, expected).cancel_waits(node.id);
        let mut effects = vec![effect.clone()];
        let ended = self.end_all(&mut uow, descendants, effect, &mut effects)?;
        self.engine.close_chain(&mut uow, &node)?;
        let committed = self.engine.store().commit(uow).await?;
        node.version += 1;

        ctx.emit_status_update(&node, from);
        self.engine.signal_task_abort(&node).await;
        for (other, other_from) in &ended {
            ctx.emit_status_update(other, *other_from);
            self.engine.signal_task_abort(other).await;
        }
        if committed.plan_ended {
            ctx.emit_plan_end(node.plan_execution_id, PlanStatus::from_node_status(node.status));
        }
        Ok(effects)
    }

    async fn toggle_node(&self, mut node: NodeExecution, to: Status) -> Result<()> {
        let ctx = self.engine.context();
        let expected = node.status;
        let from = ctx.transition(&mut node, to)?;
        let mut uow = UnitOfWork::new();
        uow.update_node(&node, expected);
        self.engine.store().commit(uow).await?;
        node.version += 1;
        ctx.emit_status_update(&node, from);
        Ok(())
    }

    /// RETRY: abandons the current attempt and queues a fresh one.
    async fn restart_node(
        &self,
        mut node: NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<Vec<InterruptEffect>> {
        let ctx = self.engine.context();
        let now = Utc::now();
        let descendants = self.engine.unfinished_descendants(&node).await?;
        let abandoned = node.clone();

        let expected = node.status;
        let from = ctx.transition(&mut node, Status::Running)?;
        if node.started_at.is_none() {
            node.started_at = Some(now);
            node.expiry_at = Some(now + to_chrono(ctx.config.default_node_timeout()));
        }
        let attempt_id = node.start_new_attempt()?;

        let mut uow = UnitOfWork::new();
        uow.update_node(&node, expected)
            .set_pending_children(node.id, 0)
            .cancel_waits(node.id)
            .enqueue(WorkItem::start_attempt(node.id, attempt_id));
        let mut effects = vec![effect.clone()];
        let ended = self.end_all(&mut uow, descendants, effect, &mut effects)?;
        self.engine.store().commit(uow).await?;
        node.version += 1;

        info!(
            node_execution_id = %node.id,
            attempt_id = %attempt_id,
            retry_count = node.retry_count(),
            "Node retried by interrupt"
        );
        ctx.emit_status_update(&node, from);
        self.engine.signal_task_abort(&abandoned).await;
        for (other, other_from) in &ended {
            ctx.emit_status_update(other, *other_from);
            self.engine.signal_task_abort(other).await;
        }
        Ok(effects)
    }

    /// Adds the ABORTED transition of each node to `uow`, recording an effect
    /// of the triggering interrupt on every one of them.
    fn end_all(
        &self,
        uow: &mut UnitOfWork,
        nodes: Vec<NodeExecution>,
        cause: &InterruptEffect,
        effects: &mut Vec<InterruptEffect>,
    ) -> Result<Vec<(NodeExecution, Status)>> {
        let ctx = self.engine.context();
        let now = Utc::now();
        let to = match cause.interrupt_type {
            InterruptType::Expire => Status::Expired,
            _ => Status::Aborted,
        };

        let mut ended = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            let effect = InterruptEffect::new(
                cause.interrupt_id,
                cause.interrupt_type,
                node.attempt_id,
                node.status,
                to,
            );
            node.interrupt_history.push(effect.clone());
            let expected = node.status;
            let from = ctx.transition(&mut node, to)?;
            node.ended_at = Some(now);
            uow.update_node(&node, expected).cancel_waits(node.id);
            effects.push(effect);
            ended.push((node, from));
        }
        Ok(ended)
    }

    /// Plan PAUSE / RESUME.
    async fn toggle_plan(
        &self,
        request: &InterruptRequest,
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
    ) -> Result<InterruptResult> {
        let store = self.engine.store();
        let existing = store.interrupts().find_by_id(request.interrupt_id).await?;
        if existing
            .as_ref()
            .is_some_and(|i| i.state != InterruptState::Registered)
        {
            return Ok(InterruptResult::AlreadyApplied);
        }

        let plan = store.plans().get(plan_id).await?;
        if plan.is_terminal() {
            self.settle_stray(existing.as_ref(), InterruptState::Discarded).await?;
            return Ok(InterruptResult::AlreadyTerminal);
        }
        if plan.status == to {
            self.settle_stray(existing.as_ref(), InterruptState::Processed).await?;
            return Ok(InterruptResult::AlreadyApplied);
        }
        self.engine.context().validate_plan_transition(&plan, to)?;
        if existing.is_none() {
            store.interrupts().create(&self.record(request, plan_id, None)).await?;
        }

        if !store.plans().transition_status(plan_id, from, to).await? {
            let current = store.plans().get(plan_id).await?;
            if current.status == to {
                store.interrupts().mark(request.interrupt_id, InterruptState::Processed).await?;
                return Ok(InterruptResult::AlreadyApplied);
            }
            return Err(OrchestratorError::ConcurrentModification { id: plan_id });
        }
        store.interrupts().mark(request.interrupt_id, InterruptState::Processed).await?;

        info!(plan_execution_id = %plan_id, from = %from, to = %to, "Plan status changed by interrupt");
        self.engine.context().emit_event(Event::InterruptApplied {
            plan_execution_id: plan_id,
            node_execution_id: None,
            interrupt_id: request.interrupt_id,
            interrupt_type: request.interrupt_type,
        });
        Ok(InterruptResult::Applied(Vec::new()))
    }

    /// ABORT_ALL: aborts every unfinished node and ends the plan ABORTED, in
    /// one commit.
    async fn abort_all(&self, request: &InterruptRequest, plan_id: Uuid) -> Result<InterruptResult> {
        let store = self.engine.store();
        let ctx = self.engine.context();
        let existing = store.interrupts().find_by_id(request.interrupt_id).await?;
        if existing
            .as_ref()
            .is_some_and(|i| i.state != InterruptState::Registered)
        {
            return Ok(InterruptResult::AlreadyApplied);
        }
        let plan = store.plans().get(plan_id).await?;
        if plan.is_terminal() {
            self.settle_stray(existing.as_ref(), InterruptState::Discarded).await?;
            return Ok(InterruptResult::AlreadyTerminal);
        }
        if existing.is_none() {
            store.interrupts().create(&self.record(request, plan_id, None)).await?;
        }

        let cause = InterruptEffect::new(
            request.interrupt_id,
            InterruptType::AbortAll,
            Uuid::nil(),
            Status::Running,
            Status::Aborted,
        );
        for _ in 0..=ctx.config.max_conflict_retries {
            let nodes = store.nodes().find_non_terminal(plan_id).await?;
            let mut uow = UnitOfWork::new();
            let mut effects = Vec::with_capacity(nodes.len());
            let ended = self.end_all(&mut uow, nodes, &cause, &mut effects)?;
            uow.end_plan(plan_id, PlanStatus::Aborted)
                .settle_interrupt(request.interrupt_id, InterruptState::Processed);

            let committed = match store.commit(uow).await {
                Ok(committed) => committed,
                Err(e) if e.is_conflict() => {
                    warn!(plan_execution_id = %plan_id, "Conflict while aborting plan, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for (node, from) in &ended {
                ctx.emit_status_update(node, *from);
            }
            join_all(ended.iter().map(|(node, _)| self.engine.signal_task_abort(node))).await;
            ctx.emit_event(Event::InterruptApplied {
                plan_execution_id: plan_id,
                node_execution_id: None,
                interrupt_id: request.interrupt_id,
                interrupt_type: InterruptType::AbortAll,
            });
            if committed.plan_ended {
                ctx.emit_plan_end(plan_id, PlanStatus::Aborted);
            }
            return Ok(InterruptResult::Applied(effects));
        }
        Err(OrchestratorError::ConcurrentModification { id: plan_id })
    }

    fn record(&self, request: &InterruptRequest, plan_id: Uuid, node_id: Option<Uuid>) -> Interrupt {
        let mut interrupt = Interrupt::new(request.interrupt_type, plan_id, node_id);
        interrupt.id = request.interrupt_id;
        interrupt
    }

    async fn settle_stray(&self, existing: Option<&Interrupt>, state: InterruptState) -> Result<()> {
        if let Some(interrupt) = existing {
            self.engine.store().interrupts().mark(interrupt.id, state).await?;
        }
        Ok(())
    }
}

/// The effect of `kind` recorded on the current attempt whose transition has
/// not happened yet.
fn pending_effect(node: &NodeExecution, kind: InterruptType) -> Option<InterruptEffect> {
    let current = |e: &&InterruptEffect| e.attempt_id == node.attempt_id;
    match kind {
        InterruptType::Abort | InterruptType::Expire | InterruptType::Retry => {
            if node.is_terminal() {
                return None;
            }
            node.interrupt_history
                .iter()
                .filter(current)
                .find(|e| e.interrupt_type == kind)
                .cloned()
        }
        InterruptType::Pause | InterruptType::Resume => {
            let latest = node
                .interrupt_history
                .iter()
                .filter(current)
                .rev()
                .find(|e| matches!(e.interrupt_type, InterruptType::Pause | InterruptType::Resume))?;
            let unfinished = latest.interrupt_type == kind && node.status != latest.to_status;
            unfinished.then(|| latest.clone())
        }
        InterruptType::AbortAll => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::EngineContext;
    use crate::wait_notify::NotifyOutcome;
    use conductor_core::{FacilitationMode, Plan, PlanNode};
    use db::{create_memory_pool, run_migrations, ExecutionStore};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    async fn engine() -> ExecutionEngine {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let config = EngineConfig::default()
            .with_pause_poll(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(5));
        ExecutionEngine::new(Arc::new(EngineContext::new(ExecutionStore::new(pool), config)))
    }

    fn waiting_plan() -> Plan {
        Plan::new("waiting", "w").with_node(
            PlanNode::new("w", "w", "wait").with_facilitation(FacilitationMode::Async),
        )
    }

    async fn parked(engine: &ExecutionEngine) -> NodeExecution {
        let plan = engine.start_plan(waiting_plan(), HashMap::new()).await.unwrap();
        engine.run_until_idle("test").await.unwrap();
        let nodes = engine.store().nodes().find_by_plan(plan.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, Status::Running);
        nodes[0].clone()
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let interrupts = engine.interrupts();

        let request = InterruptRequest::node(InterruptType::Abort, node.id);
        let result = interrupts.apply(request.clone()).await.unwrap();
        assert!(result.is_applied());

        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Aborted);
        assert_eq!(stored.interrupt_history.len(), 1);
        let plan = engine.store().plans().get(node.plan_execution_id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Aborted);

        assert_eq!(interrupts.apply(request).await.unwrap(), InterruptResult::AlreadyApplied);
        assert_eq!(
            interrupts
                .apply(InterruptRequest::node(InterruptType::Abort, node.id))
                .await
                .unwrap(),
            InterruptResult::AlreadyTerminal
        );
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.interrupt_history.len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_effect_completes_without_duplicate() {
        let engine = engine().await;
        let mut node = parked(&engine).await;
        let request = InterruptRequest::node(InterruptType::Abort, node.id);

        // Effect persisted, transition never happened.
        node.interrupt_history.push(InterruptEffect::new(
            request.interrupt_id,
            InterruptType::Abort,
            node.attempt_id,
            Status::Running,
            Status::Aborted,
        ));
        let mut uow = UnitOfWork::new();
        uow.update_node(&node, node.status);
        engine.store().commit(uow).await.unwrap();

        let result = engine.interrupts().apply(request).await.unwrap();
        assert!(result.is_applied());
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Aborted);
        assert_eq!(stored.interrupt_history.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_is_not_user_issuable() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let err = engine
            .interrupts()
            .apply(InterruptRequest::node(InterruptType::Expire, node.id))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInterrupt(_)));

        let past_deadline = node.expiry_at.unwrap() + chrono::Duration::seconds(1);
        assert!(engine.interrupts().expire(node.id, past_deadline).await.unwrap().is_applied());
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Expired);
    }

    #[tokio::test]
    async fn test_expire_before_deadline_is_not_due() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let deadline = node.expiry_at.unwrap();
        assert!(deadline > Utc::now());

        let result = engine.interrupts().expire(node.id, Utc::now()).await.unwrap();
        assert_eq!(result, InterruptResult::NotDue);
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Running);
        assert!(stored.interrupt_history.is_empty());

        let result = engine.interrupts().expire(node.id, deadline).await.unwrap();
        assert!(result.is_applied());
    }

    #[tokio::test]
    async fn test_suspended_node_resumes_after_resume() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let interrupts = engine.interrupts();
        let correlation_id = node.notify_id.clone().unwrap();

        interrupts
            .apply(InterruptRequest::node(InterruptType::Pause, node.id))
            .await
            .unwrap();
        assert_eq!(
            interrupts
                .apply(InterruptRequest::node(InterruptType::Pause, node.id))
                .await
                .unwrap(),
            InterruptResult::AlreadyApplied
        );

        let outcome = engine
            .context()
            .wait_notify
            .notify(&correlation_id, json!({"status": "succeeded"}))
            .await
            .unwrap();
        assert!(matches!(outcome, NotifyOutcome::Resumed { .. }));
        engine.run_until_idle("test").await.unwrap();
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Suspended);

        interrupts
            .apply(InterruptRequest::node(InterruptType::Resume, node.id))
            .await
            .unwrap();
        let plan = engine
            .drive_until_ended(node.plan_execution_id, "test", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Succeeded);
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Succeeded);
        assert_eq!(stored.interrupt_history.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_starts_new_attempt() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let old_correlation = node.notify_id.clone().unwrap();

        let result = engine
            .interrupts()
            .apply(InterruptRequest::node(InterruptType::Retry, node.id))
            .await
            .unwrap();
        assert!(result.is_applied());
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.retry_count(), 1);
        assert_ne!(stored.attempt_id, node.attempt_id);

        // The old wait is gone; its notify is ignored.
        let outcome = engine
            .context()
            .wait_notify
            .notify(&old_correlation, json!({}))
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Ignored);

        engine.run_until_idle("test").await.unwrap();
        let stored = engine.store().nodes().get(node.id).await.unwrap();
        assert_eq!(stored.status, Status::Running);
        assert!(stored.notify_id.is_some());
        assert_ne!(stored.notify_id.as_deref(), Some(old_correlation.as_str()));
    }

    #[tokio::test]
    async fn test_plan_pause_and_abort_all() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let plan_id = node.plan_execution_id;
        let interrupts = engine.interrupts();

        assert!(interrupts
            .apply(InterruptRequest::plan(InterruptType::Pause, plan_id))
            .await
            .unwrap()
            .is_applied());
        let plan = engine.store().plans().get(plan_id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Paused);
        assert_eq!(
            interrupts
                .apply(InterruptRequest::plan(InterruptType::Pause, plan_id))
                .await
                .unwrap(),
            InterruptResult::AlreadyApplied
        );

        let abort = InterruptRequest::plan(InterruptType::AbortAll, plan_id);
        match interrupts.apply(abort.clone()).await.unwrap() {
            InterruptResult::Applied(effects) => assert_eq!(effects.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        let plan = engine.store().plans().get(plan_id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Aborted);
        assert_eq!(interrupts.apply(abort).await.unwrap(), InterruptResult::AlreadyApplied);

        let recorded = engine.store().interrupts().find_by_plan(plan_id).await.unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|i| i.state == InterruptState::Processed));
    }

    #[tokio::test]
    async fn test_wrong_target_is_rejected() {
        let engine = engine().await;
        let node = parked(&engine).await;
        let err = engine
            .interrupts()
            .apply(InterruptRequest::plan(InterruptType::Retry, node.plan_execution_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInterrupt(_)));
    }
}
