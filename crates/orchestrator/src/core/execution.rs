//! Execution engine driving plans off the durable work queue.
//!
//! Workers claim one [`WorkItem`] at a time and hand it to
//! [`ExecutionEngine::process`]. Every handler re-reads the records it needs,
//! decides, and commits its writes as one unit; nothing is kept in memory
//! between items, so any worker (or a restarted process) can pick up any item.

use chrono::{DateTime, Utc};
use conductor_core::{
    new_correlation_id, to_chrono, CoreError, ExecutableResponse, FailureInfo, NodeExecution,
    Plan, PlanExecution, PlanNode, PlanStatus, Status, WaitInstance, WaitPurpose, WorkItem,
    WorkKind, CHILD_FAILED,
};
use db::{ExecutionStore, UnitOfWork};
use events::{Event, NodeEventData};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::step::{StepContext, StepOutcome};
use crate::advisers::{AdviserResponse, AdvisingEvent};
use crate::error::{OrchestratorError, Result};
use crate::interrupts::InterruptManager;
use crate::services::EngineContext;
use crate::wait_notify::{delay_item, delay_response};

/// What the worker does with the item it processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkDisposition {
    /// Done; delete the item.
    Completed,
    /// Not actionable yet; give it back, ready again at the given instant.
    Deferred(DateTime<Utc>),
}

#[derive(Clone)]
pub struct ExecutionEngine {
    ctx: Arc<EngineContext>,
}

impl ExecutionEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.ctx.store
    }

    pub fn interrupts(&self) -> InterruptManager {
        InterruptManager::new(self.clone())
    }

    /// Validates `plan` and creates its execution with a queued root node.
    pub async fn start_plan(
        &self,
        plan: Plan,
        setup_abstractions: HashMap<String, String>,
    ) -> Result<PlanExecution> {
        plan.validate()?;
        if let Some(node) = plan
            .nodes
            .iter()
            .find(|node| !self.ctx.steps.contains(&node.step_type))
        {
            return Err(CoreError::invalid_plan(format!(
                "node `{}` uses unknown step type `{}`",
                node.id, node.step_type
            ))
            .into());
        }

        let config = &self.ctx.config;
        let execution = PlanExecution::new(
            plan,
            setup_abstractions,
            config.plan_retention(),
            config.iteration_interval(),
        );
        let start = execution
            .plan
            .start_node()
            .ok_or_else(|| CoreError::invalid_plan("start node is missing"))?;
        let root = NodeExecution::new(&execution.root_ambiance(), start)?;
        self.store().create_plan_execution(&execution, &root).await?;

        info!(
            plan_execution_id = %execution.id,
            plan = %execution.plan.name,
            root = %root.id,
            "Plan execution started"
        );
        self.ctx.emit_event(Event::PlanStart {
            plan_execution_id: execution.id,
            plan_name: execution.plan.name.clone(),
        });
        Ok(execution)
    }

    /// Claims and processes one ready item. Returns false when nothing was ready.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let lease = to_chrono(self.ctx.config.claim_ttl());
        let Some(item) = self.store().work().claim(worker_id, now, lease).await? else {
            return Ok(false);
        };

        let work = self.store().work();
        match self.process(&item).await {
            Ok(WorkDisposition::Completed) => {
                if !work.complete(item.id, worker_id).await? {
                    warn!(work_item_id = %item.id, worker_id, "Lease lost before completion");
                }
            }
            Ok(WorkDisposition::Deferred(ready_at)) => {
                debug!(work_item_id = %item.id, kind = %item.kind, ready_at = %ready_at, "Work deferred");
                work.release(item.id, worker_id, ready_at).await?;
            }
            Err(e) => {
                let ready_at = Utc::now() + to_chrono(self.ctx.config.requeue_backoff());
                warn!(
                    work_item_id = %item.id,
                    kind = %item.kind,
                    attempts = item.attempts,
                    error = %e,
                    "Work failed, re-queued with backoff"
                );
                work.release(item.id, worker_id, ready_at).await?;
            }
        }
        Ok(true)
    }

    /// Processes items until none is ready. Returns how many were processed.
    pub async fn run_until_idle(&self, worker_id: &str) -> Result<usize> {
        let mut processed = 0;
        while self.process_next(worker_id).await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Works the queue until the plan ends or `timeout` passes, and returns the
    /// plan as last read.
    pub async fn drive_until_ended(
        &self,
        plan_execution_id: Uuid,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<PlanExecution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.run_until_idle(worker_id).await?;
            let plan = self.store().plans().get(plan_execution_id).await?;
            if plan.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(plan);
            }
            tokio::time::sleep(self.ctx.config.poll_interval()).await;
        }
    }

    /// Runs the handler for `item`, retrying on concurrent modification. A
    /// node whose processing violates an engine invariant is failed.
    pub async fn process(&self, item: &WorkItem) -> Result<WorkDisposition> {
        let mut conflicts = 0;
        loop {
            let result = match item.kind {
                WorkKind::StartNode => self.handle_start(item).await,
                WorkKind::ResumeNode => self.handle_resume(item).await,
                WorkKind::ChildrenCompleted => self.handle_children_completed(item).await,
                WorkKind::DelayElapsed => self.handle_delay(item).await,
            };
            match result {
                Err(e) if e.is_conflict() && conflicts < self.ctx.config.max_conflict_retries => {
                    conflicts += 1;
                    warn!(work_item_id = %item.id, kind = %item.kind, conflicts, "Conflict, re-reading");
                }
                Err(e) if e.is_invariant_violation() => {
                    let Some(node_id) = item.node_execution_id else {
                        return Err(e);
                    };
                    self.fail_internal(node_id, &e.to_string()).await?;
                    return Ok(WorkDisposition::Completed);
                }
                other => return other,
            }
        }
    }

    async fn handle_start(&self, item: &WorkItem) -> Result<WorkDisposition> {
        let Some(node) = self.load_item_node(item).await? else {
            return Ok(WorkDisposition::Completed);
        };
        if let Some(deferred) = self.plan_gate(&node).await? {
            return Ok(deferred);
        }

        match (node.status, item.attempt_id()) {
            (Status::Queued, _) => self.start_node(node).await,
            (Status::Running, Some(attempt))
                if attempt == node.attempt_id && node.executable_response.is_none() =>
            {
                self.run_attempt(node).await
            }
            (Status::Suspended, Some(attempt)) if attempt == node.attempt_id => {
                Ok(self.defer_for_pause())
            }
            (status, _) => {
                debug!(node_execution_id = %node.id, status = %status, "Stale start ignored");
                Ok(WorkDisposition::Completed)
            }
        }
    }

    async fn handle_resume(&self, item: &WorkItem) -> Result<WorkDisposition> {
        let Some(node) = self.load_item_node(item).await? else {
            return Ok(WorkDisposition::Completed);
        };
        if let Some(deferred) = self.plan_gate(&node).await? {
            return Ok(deferred);
        }

        if let Some(stashed) = item.outcome() {
            if item.attempt_id() != Some(node.attempt_id) || node.is_terminal() {
                debug!(node_execution_id = %node.id, "Stashed outcome for a finished attempt dropped");
                return Ok(WorkDisposition::Completed);
            }
            if node.status == Status::Suspended {
                return Ok(self.defer_for_pause());
            }
            let outcome: StepOutcome = serde_json::from_value(stashed.clone())?;
            return self.conclude(node.id, node.attempt_id, outcome).await;
        }

        let Some(correlation_id) = item.correlation_id() else {
            warn!(work_item_id = %item.id, "Resume item without correlation id dropped");
            return Ok(WorkDisposition::Completed);
        };
        if node.is_terminal() || node.notify_id.as_deref() != Some(correlation_id) {
            debug!(
                node_execution_id = %node.id,
                correlation_id,
                status = %node.status,
                "Stale resume ignored"
            );
            return Ok(WorkDisposition::Completed);
        }
        if node.status == Status::Suspended {
            return Ok(self.defer_for_pause());
        }
        let Some(wait) = self.store().waits().find(correlation_id).await? else {
            debug!(node_execution_id = %node.id, correlation_id, "Resume without wait ignored");
            return Ok(WorkDisposition::Completed);
        };

        match wait.purpose {
            WaitPurpose::RetryDelay => {
                let mut node = node;
                let expected = node.status;
                node.notify_id = None;
                let mut uow = UnitOfWork::new();
                uow.update_node(&node, expected);
                self.store().commit(uow).await?;
                node.version += 1;
                self.run_attempt(node).await
            }
            WaitPurpose::AsyncStep => {
                let plan = self.plan_of(&node).await?;
                let plan_node = self.plan_node(&plan, &node.plan_node_id)?.clone();
                let executor = self.ctx.steps.get(&node.step_type).ok_or_else(|| {
                    OrchestratorError::invariant(format!(
                        "no executor registered for step type `{}`",
                        node.step_type
                    ))
                })?;
                let step_ctx = self.step_context(&node, &plan_node);
                let response = wait.response.unwrap_or(Value::Null);
                info!(node_execution_id = %node.id, correlation_id, "Node resumed");
                let result = executor.handle_response(&step_ctx, &response).await;
                self.conclude(node.id, node.attempt_id, StepOutcome::from_result(result))
                    .await
            }
        }
    }

    async fn handle_children_completed(&self, item: &WorkItem) -> Result<WorkDisposition> {
        let Some(parent) = self.load_item_node(item).await? else {
            return Ok(WorkDisposition::Completed);
        };
        if let Some(deferred) = self.plan_gate(&parent).await? {
            return Ok(deferred);
        }
        match parent.status {
            Status::Running => {}
            Status::Suspended => return Ok(self.defer_for_pause()),
            status => {
                debug!(node_execution_id = %parent.id, status = %status, "Stale fan-in ignored");
                return Ok(WorkDisposition::Completed);
            }
        }

        let children: Vec<NodeExecution> = self
            .store()
            .nodes()
            .find_children(parent.id)
            .await?
            .into_iter()
            .filter(|child| child.belongs_to_attempt_of(&parent))
            .collect();
        let outcome = aggregate_children(&children);
        debug!(
            node_execution_id = %parent.id,
            children = children.len(),
            status = %outcome.status,
            "Children completed"
        );
        self.conclude(parent.id, parent.attempt_id, outcome).await
    }

    async fn handle_delay(&self, item: &WorkItem) -> Result<WorkDisposition> {
        let Some(correlation_id) = item.correlation_id() else {
            warn!(work_item_id = %item.id, "Delay item without correlation id dropped");
            return Ok(WorkDisposition::Completed);
        };
        self.ctx
            .wait_notify
            .notify(correlation_id, delay_response(item))
            .await?;
        Ok(WorkDisposition::Completed)
    }

    /// QUEUED -> RUNNING: resolves parameters, registers the wait for
    /// asynchronous steps, then runs the first attempt.
    async fn start_node(&self, mut node: NodeExecution) -> Result<WorkDisposition> {
        let plan = self.plan_of(&node).await?;
        let plan_node = self.plan_node(&plan, &node.plan_node_id)?.clone();
        let resolved = match &node.resolved_parameters {
            Some(parameters) => Ok(parameters.clone()),
            None => self.ctx.resolver.resolve(&plan_node.parameters, &node.ambiance),
        };

        let now = Utc::now();
        let expected = node.status;
        let from = self.ctx.transition(&mut node, Status::Running)?;
        let timeout = plan_node
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.ctx.config.default_node_timeout());
        node.started_at = Some(now);
        node.expiry_at = Some(now + to_chrono(timeout));

        let mut uow = UnitOfWork::new();
        let failure = match resolved {
            Ok(parameters) => {
                node.resolved_parameters = Some(parameters);
                if node.facilitation.awaits_notify() {
                    park(&mut node, &mut uow, WaitPurpose::AsyncStep);
                }
                None
            }
            Err(failure) => Some(failure),
        };
        uow.update_node(&node, expected);
        self.store().commit(uow).await?;
        node.version += 1;

        info!(
            node_execution_id = %node.id,
            identifier = %node.identifier,
            step_type = %node.step_type,
            "Node started"
        );
        self.ctx.emit_event(Event::NodeStart {
            node: NodeEventData::from(&node),
        });
        self.ctx.emit_status_update(&node, from);

        match failure {
            Some(failure) => {
                warn!(node_execution_id = %node.id, error = %failure.error_message(), "Parameter resolution failed");
                self.conclude(node.id, node.attempt_id, StepOutcome::failed(failure))
                    .await
            }
            None => self.invoke(node, &plan_node).await,
        }
    }

    /// Runs the current attempt of a node that is already RUNNING (retries).
    async fn run_attempt(&self, mut node: NodeExecution) -> Result<WorkDisposition> {
        let plan = self.plan_of(&node).await?;
        let plan_node = self.plan_node(&plan, &node.plan_node_id)?.clone();
        if node.resolved_parameters.is_none() {
            match self.ctx.resolver.resolve(&plan_node.parameters, &node.ambiance) {
                Ok(parameters) => node.resolved_parameters = Some(parameters),
                Err(failure) => {
                    return self
                        .conclude(node.id, node.attempt_id, StepOutcome::failed(failure))
                        .await
                }
            }
        }

        let expected = node.status;
        let mut uow = UnitOfWork::new();
        if node.facilitation.awaits_notify() && node.notify_id.is_none() {
            park(&mut node, &mut uow, WaitPurpose::AsyncStep);
        }
        uow.update_node(&node, expected);
        self.store().commit(uow).await?;
        node.version += 1;

        info!(
            node_execution_id = %node.id,
            attempt_id = %node.attempt_id,
            retry_count = node.retry_count(),
            "Attempt started"
        );
        self.invoke(node, &plan_node).await
    }

    /// Calls the step executor and routes its answer by facilitation mode.
    async fn invoke(&self, node: NodeExecution, plan_node: &PlanNode) -> Result<WorkDisposition> {
        let executor = self.ctx.steps.get(&node.step_type).ok_or_else(|| {
            OrchestratorError::invariant(format!(
                "no executor registered for step type `{}`",
                node.step_type
            ))
        })?;
        let step_ctx = self.step_context(&node, plan_node);
        let span = info_span!(
            "step",
            node_execution_id = %node.id,
            step_type = %node.step_type,
            context = ?node.ambiance.log_context()
        );
        let result = executor.execute(&step_ctx).instrument(span).await;

        let response = match result {
            Ok(response) => response,
            Err(failure) => {
                return self
                    .conclude(node.id, node.attempt_id, StepOutcome::failed(failure))
                    .await
            }
        };
        if !response.fits(node.facilitation) {
            return Err(OrchestratorError::invariant(format!(
                "step `{}` answered `{}` under {} facilitation",
                node.identifier,
                response.kind(),
                node.facilitation.as_str()
            )));
        }

        match &response {
            ExecutableResponse::Sync { outputs } => {
                let outcome = StepOutcome::succeeded(outputs.clone());
                self.conclude(node.id, node.attempt_id, outcome).await
            }
            ExecutableResponse::Async {
                callback_id,
                resume_after_ms,
            } => {
                self.check_callback(&node, callback_id)?;
                let delay = resume_after_ms.map(Duration::from_millis);
                self.record_response(&node, response.clone(), delay).await
            }
            ExecutableResponse::Task { callback_id, .. } => {
                self.check_callback(&node, callback_id)?;
                self.record_response(&node, response.clone(), None).await
            }
            ExecutableResponse::Child { child_node_id } => {
                let children = vec![child_node_id.clone()];
                self.spawn_children(&node, children, response.clone()).await
            }
            ExecutableResponse::Children { child_node_ids } => {
                let children = child_node_ids.clone();
                self.spawn_children(&node, children, response.clone()).await
            }
        }
    }

    fn check_callback(&self, node: &NodeExecution, callback_id: &str) -> Result<()> {
        if node.notify_id.as_deref() == Some(callback_id) {
            Ok(())
        } else {
            Err(OrchestratorError::invariant(format!(
                "step `{}` answered with callback `{callback_id}` instead of its registered correlation id",
                node.identifier
            )))
        }
    }

    /// Stores the executable response of a parked node, plus its optional
    /// durable timer. The worker is released afterwards.
    async fn record_response(
        &self,
        node: &NodeExecution,
        response: ExecutableResponse,
        delay: Option<Duration>,
    ) -> Result<WorkDisposition> {
        for _ in 0..=self.ctx.config.max_conflict_retries {
            let Some(mut current) = self.store().nodes().find_by_id(node.id).await? else {
                return Ok(WorkDisposition::Completed);
            };
            if current.attempt_id != node.attempt_id
                || current.is_terminal()
                || current.notify_id != node.notify_id
            {
                debug!(node_execution_id = %node.id, "Response for a superseded attempt dropped");
                return Ok(WorkDisposition::Completed);
            }

            current.executable_response = Some(response.clone());
            let mut uow = UnitOfWork::new();
            uow.update_node(&current, current.status);
            if let (Some(delay), Some(correlation_id)) = (delay, current.notify_id.as_deref()) {
                uow.enqueue(delay_item(correlation_id, delay, HashMap::new()));
            }
            match self.store().commit(uow).await {
                Ok(_) => {
                    debug!(
                        node_execution_id = %node.id,
                        response = response.kind(),
                        task_id = ?response.task_id(),
                        "Node parked"
                    );
                    return Ok(WorkDisposition::Completed);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::ConcurrentModification { id: node.id })
    }

    /// Creates the children of the current attempt, sets the fan-in counter
    /// and queues every child, in one commit.
    async fn spawn_children(
        &self,
        node: &NodeExecution,
        child_node_ids: Vec<String>,
        response: ExecutableResponse,
    ) -> Result<WorkDisposition> {
        if child_node_ids.is_empty() {
            return Err(OrchestratorError::invariant(format!(
                "step `{}` spawned no children",
                node.identifier
            )));
        }
        let plan = self.plan_of(node).await?;

        for _ in 0..=self.ctx.config.max_conflict_retries {
            let Some(mut current) = self.store().nodes().find_by_id(node.id).await? else {
                return Ok(WorkDisposition::Completed);
            };
            if current.attempt_id != node.attempt_id || current.is_terminal() {
                debug!(node_execution_id = %node.id, "Children for a superseded attempt dropped");
                return Ok(WorkDisposition::Completed);
            }

            let mut uow = UnitOfWork::new();
            for id in &child_node_ids {
                let child = NodeExecution::new(&current.ambiance, self.plan_node(&plan, id)?)?
                    .with_parent(Some(current.id));
                uow.insert_node(&child).enqueue(WorkItem::start_node(child.id));
            }
            current.executable_response = Some(response.clone());
            uow.update_node(&current, current.status)
                .set_pending_children(current.id, child_node_ids.len() as i64);

            match self.store().commit(uow).await {
                Ok(_) => {
                    info!(
                        node_execution_id = %node.id,
                        children = child_node_ids.len(),
                        "Children spawned"
                    );
                    return Ok(WorkDisposition::Completed);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::ConcurrentModification { id: node.id })
    }

    /// Hands a step outcome to the advisers and applies their decision. The
    /// outcome is never lost: while the node is suspended, or when conflicts
    /// persist, it is kept in a work item and applied later.
    async fn conclude(
        &self,
        node_id: Uuid,
        attempt_id: Uuid,
        outcome: StepOutcome,
    ) -> Result<WorkDisposition> {
        for _ in 0..=self.ctx.config.max_conflict_retries {
            let Some(node) = self.store().nodes().find_by_id(node_id).await? else {
                return Ok(WorkDisposition::Completed);
            };
            if node.attempt_id != attempt_id || node.is_terminal() {
                debug!(node_execution_id = %node_id, "Outcome for a superseded attempt dropped");
                return Ok(WorkDisposition::Completed);
            }
            if node.status == Status::Suspended {
                self.stash_outcome(&node, &outcome, Utc::now() + to_chrono(self.ctx.config.pause_poll()))
                    .await?;
                return Ok(WorkDisposition::Completed);
            }

            match self.advise_and_apply(node, &outcome).await {
                Err(e) if e.is_conflict() => {
                    warn!(node_execution_id = %node_id, "Conflict while concluding node, re-reading");
                }
                other => return other,
            }
        }

        let node = self.store().nodes().get(node_id).await?;
        self.stash_outcome(&node, &outcome, Utc::now() + to_chrono(self.ctx.config.requeue_backoff()))
            .await?;
        Ok(WorkDisposition::Completed)
    }

    async fn stash_outcome(
        &self,
        node: &NodeExecution,
        outcome: &StepOutcome,
        ready_at: DateTime<Utc>,
    ) -> Result<()> {
        let item =
            WorkItem::resume_with_outcome(node.id, node.attempt_id, serde_json::to_value(outcome)?)
                .with_ready_at(ready_at);
        self.store().work().enqueue(&item).await?;
        debug!(node_execution_id = %node.id, status = %outcome.status, "Outcome kept for later");
        Ok(())
    }

    async fn advise_and_apply(
        &self,
        mut node: NodeExecution,
        outcome: &StepOutcome,
    ) -> Result<WorkDisposition> {
        let plan = self.plan_of(&node).await?;
        let plan_node = self.plan_node(&plan, &node.plan_node_id)?.clone();

        let retry_count = node.retry_count() as u32;
        if retry_count >= self.ctx.config.max_retry_attempts
            || node.expiry_at.is_some_and(|at| at <= Utc::now())
        {
            node.adviser_expired = true;
        }
        let event = AdvisingEvent::new(outcome.status)
            .with_failure(outcome.failure.clone())
            .with_retry_count(retry_count)
            .with_expired(node.adviser_expired)
            .with_edges(
                plan_node.next_node_id.clone(),
                plan_node.on_failure_node_id.clone(),
            );
        let advice = if outcome.interrupted {
            AdviserResponse::MarkFailed
        } else {
            self.ctx.advisers.advise(&plan_node.advisers, &event)
        };
        info!(node_execution_id = %node.id, advice = %advice, interrupted = outcome.interrupted, "Node advised");

        match advice.clone() {
            AdviserResponse::NextStep {
                next_node_id,
                status,
            } => {
                self.finalize(node, &plan, status, outcome, next_node_id, &advice)
                    .await
            }
            AdviserResponse::MarkSuccess { next_node_id } => {
                self.finalize(node, &plan, Status::Succeeded, outcome, next_node_id, &advice)
                    .await
            }
            AdviserResponse::IgnoreFailure { next_node_id } => {
                self.finalize(node, &plan, Status::IgnoreFailed, outcome, next_node_id, &advice)
                    .await
            }
            AdviserResponse::MarkFailed => {
                self.finalize(node, &plan, Status::Failed, outcome, None, &advice)
                    .await
            }
            AdviserResponse::EndPlan { status } => {
                self.end_plan_with(node, outcome, status, &advice).await
            }
            AdviserResponse::Retry { delay, attempt } => {
                self.retry(node, outcome, delay, attempt, &advice).await
            }
        }
    }

    /// Moves the node to its terminal `status`, then either queues the next
    /// node of the chain or closes the chain.
    async fn finalize(
        &self,
        mut node: NodeExecution,
        plan: &PlanExecution,
        status: Status,
        outcome: &StepOutcome,
        next_node_id: Option<String>,
        advice: &AdviserResponse,
    ) -> Result<WorkDisposition> {
        let expected = node.status;
        let from = self.ctx.transition(&mut node, status)?;
        node.ended_at = Some(Utc::now());
        node.outputs = outcome.outputs.clone();
        node.failure_info = outcome.failure.clone();

        let mut uow = UnitOfWork::new();
        let successor = match next_node_id {
            Some(next_id) => {
                let scope = node.ambiance.clone_for_finish()?;
                let next = NodeExecution::new(&scope, self.plan_node(plan, &next_id)?)?
                    .with_parent(node.parent_id)
                    .with_previous(node.id);
                node.next_id = Some(next.id);
                uow.insert_node(&next).enqueue(WorkItem::start_node(next.id));
                Some(next)
            }
            None => None,
        };
        uow.update_node(&node, expected).cancel_waits(node.id);
        if successor.is_none() {
            self.close_chain(&mut uow, &node)?;
        }
        let committed = self.store().commit(uow).await?;
        node.version += 1;

        info!(
            node_execution_id = %node.id,
            identifier = %node.identifier,
            status = %node.status,
            next = ?successor.as_ref().map(|n| n.id),
            "Node finished"
        );
        self.emit_advised(&node, advice);
        self.ctx.emit_status_update(&node, from);
        if committed.plan_ended {
            self.ctx
                .emit_plan_end(node.plan_execution_id, PlanStatus::from_node_status(node.status));
        }
        Ok(WorkDisposition::Completed)
    }

    /// Same record, new attempt. Without delay the attempt is queued at once;
    /// otherwise the node waits on a durable timer.
    async fn retry(
        &self,
        mut node: NodeExecution,
        outcome: &StepOutcome,
        delay: Duration,
        attempt: u32,
        advice: &AdviserResponse,
    ) -> Result<WorkDisposition> {
        let expected = node.status;
        let from = self.ctx.transition(&mut node, Status::Running)?;
        node.failure_info = outcome.failure.clone();
        let attempt_id = node.start_new_attempt()?;

        let mut uow = UnitOfWork::new();
        uow.cancel_waits(node.id);
        if delay.is_zero() {
            uow.enqueue(WorkItem::start_attempt(node.id, attempt_id));
        } else {
            let correlation_id = park(&mut node, &mut uow, WaitPurpose::RetryDelay);
            let mut context = HashMap::new();
            context.insert("reason".to_string(), "retry".to_string());
            uow.enqueue(delay_item(&correlation_id, delay, context));
        }
        uow.update_node(&node, expected);
        self.store().commit(uow).await?;
        node.version += 1;

        info!(
            node_execution_id = %node.id,
            attempt,
            retry_count = node.retry_count(),
            delay_ms = delay.as_millis() as u64,
            "Retrying node"
        );
        self.emit_advised(&node, advice);
        self.ctx.emit_status_update(&node, from);
        Ok(WorkDisposition::Completed)
    }

    /// Finalises the node and ends the whole plan, aborting whatever still runs.
    async fn end_plan_with(
        &self,
        mut node: NodeExecution,
        outcome: &StepOutcome,
        plan_status: PlanStatus,
        advice: &AdviserResponse,
    ) -> Result<WorkDisposition> {
        let now = Utc::now();
        let expected = node.status;
        let node_status = if outcome.status.is_positive() {
            Status::Succeeded
        } else {
            Status::Failed
        };
        let from = self.ctx.transition(&mut node, node_status)?;
        node.ended_at = Some(now);
        node.outputs = outcome.outputs.clone();
        node.failure_info = outcome.failure.clone();

        let mut uow = UnitOfWork::new();
        uow.update_node(&node, expected).cancel_waits(node.id);
        let mut aborted = Vec::new();
        for mut other in self
            .store()
            .nodes()
            .find_non_terminal(node.plan_execution_id)
            .await?
            .into_iter()
            .filter(|other| other.id != node.id)
        {
            let other_expected = other.status;
            let other_from = self.ctx.transition(&mut other, Status::Aborted)?;
            other.ended_at = Some(now);
            uow.update_node(&other, other_expected).cancel_waits(other.id);
            aborted.push((other, other_from));
        }
        uow.end_plan(node.plan_execution_id, plan_status);
        let committed = self.store().commit(uow).await?;
        node.version += 1;

        info!(
            node_execution_id = %node.id,
            plan_status = %plan_status,
            aborted = aborted.len(),
            "Node ended the plan"
        );
        self.emit_advised(&node, advice);
        self.ctx.emit_status_update(&node, from);
        for (other, other_from) in &aborted {
            self.ctx.emit_status_update(other, *other_from);
            self.signal_task_abort(other).await;
        }
        if committed.plan_ended {
            self.ctx.emit_plan_end(node.plan_execution_id, plan_status);
        }
        Ok(WorkDisposition::Completed)
    }

    /// Marks a node FAILED with `ENGINE_INTERNAL_ERROR`, bypassing advisers.
    pub(crate) async fn fail_internal(&self, node_id: Uuid, message: &str) -> Result<()> {
        for _ in 0..=self.ctx.config.max_conflict_retries {
            let Some(mut node) = self.store().nodes().find_by_id(node_id).await? else {
                return Ok(());
            };
            if node.is_terminal() {
                return Ok(());
            }
            let expected = node.status;
            let from = self.ctx.transition(&mut node, Status::Failed)?;
            node.ended_at = Some(Utc::now());
            node.failure_info = Some(FailureInfo::internal(message));

            let mut uow = UnitOfWork::new();
            uow.update_node(&node, expected).cancel_waits(node.id);
            if let Err(e) = self.close_chain(&mut uow, &node) {
                error!(node_execution_id = %node.id, error = %e, "Cannot close chain of failed node");
            }
            match self.store().commit(uow).await {
                Ok(committed) => {
                    node.version += 1;
                    error!(node_execution_id = %node.id, error = message, "Node failed on engine invariant");
                    self.ctx.emit_status_update(&node, from);
                    if committed.plan_ended {
                        self.ctx.emit_plan_end(node.plan_execution_id, PlanStatus::Failed);
                    }
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::ConcurrentModification { id: node_id })
    }

    /// The node ends its chain: count it against the parent's fan-in, or end
    /// the plan when it is the root chain.
    pub(crate) fn close_chain(&self, uow: &mut UnitOfWork, node: &NodeExecution) -> Result<()> {
        match node.parent_id {
            Some(parent_id) => {
                let level = node
                    .ambiance
                    .parent_level()
                    .ok_or(CoreError::EmptyLevelStack)?;
                let parent_attempt = Uuid::parse_str(&level.runtime_id).map_err(|_| {
                    OrchestratorError::invariant(format!(
                        "parent level of `{}` carries no attempt id",
                        node.identifier
                    ))
                })?;
                uow.fan_in(parent_id, parent_attempt);
            }
            None => {
                uow.end_plan(
                    node.plan_execution_id,
                    PlanStatus::from_node_status(node.status),
                );
            }
        }
        Ok(())
    }

    /// Unfinished nodes below `node`, across all its attempts.
    pub(crate) async fn unfinished_descendants(
        &self,
        node: &NodeExecution,
    ) -> Result<Vec<NodeExecution>> {
        let mut pending = vec![node.id];
        let mut found = Vec::new();
        while let Some(parent_id) = pending.pop() {
            for child in self.store().nodes().find_children(parent_id).await? {
                pending.push(child.id);
                if !child.is_terminal() {
                    found.push(child);
                }
            }
        }
        Ok(found)
    }

    /// Asks the task dispatcher to stop the node's pending task, if it has one.
    pub(crate) async fn signal_task_abort(&self, node: &NodeExecution) {
        let Some(task_id) = node
            .executable_response
            .as_ref()
            .and_then(ExecutableResponse::task_id)
        else {
            return;
        };
        if let Err(e) = self.ctx.task_dispatcher.abort_task(task_id).await {
            warn!(node_execution_id = %node.id, task_id, error = %e, "Task abort failed");
        }
    }

    fn emit_advised(&self, node: &NodeExecution, advice: &AdviserResponse) {
        self.ctx.emit_event(Event::NodeAdvised {
            node: NodeEventData::from(node),
            advice: advice.to_string(),
        });
    }

    async fn load_item_node(&self, item: &WorkItem) -> Result<Option<NodeExecution>> {
        let Some(node_id) = item.node_execution_id else {
            warn!(work_item_id = %item.id, kind = %item.kind, "Work item without node dropped");
            return Ok(None);
        };
        let node = self.store().nodes().find_by_id(node_id).await?;
        if node.is_none() {
            debug!(work_item_id = %item.id, node_execution_id = %node_id, "Work for a purged node dropped");
        }
        Ok(node)
    }

    /// Defers node work while the plan is paused.
    async fn plan_gate(&self, node: &NodeExecution) -> Result<Option<WorkDisposition>> {
        let plan = self.plan_of(node).await?;
        if plan.status == PlanStatus::Paused {
            return Ok(Some(self.defer_for_pause()));
        }
        Ok(None)
    }

    fn defer_for_pause(&self) -> WorkDisposition {
        WorkDisposition::Deferred(Utc::now() + to_chrono(self.ctx.config.pause_poll()))
    }

    async fn plan_of(&self, node: &NodeExecution) -> Result<PlanExecution> {
        Ok(self.store().plans().get(node.plan_execution_id).await?)
    }

    fn plan_node<'a>(&self, plan: &'a PlanExecution, plan_node_id: &str) -> Result<&'a PlanNode> {
        plan.plan.node(plan_node_id).ok_or_else(|| {
            OrchestratorError::invariant(format!("plan has no node `{plan_node_id}`"))
        })
    }

    fn step_context(&self, node: &NodeExecution, plan_node: &PlanNode) -> StepContext {
        StepContext {
            node_execution_id: node.id,
            plan_execution_id: node.plan_execution_id,
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            attempt_id: node.attempt_id,
            retry_count: node.retry_count() as u32,
            ambiance: node.ambiance.clone(),
            parameters: node.resolved_parameters.clone().unwrap_or(Value::Null),
            children: plan_node.children.clone(),
            correlation_id: node.notify_id.clone(),
            task_dispatcher: self.ctx.task_dispatcher.clone(),
        }
    }
}

/// Allocates a correlation id for `node`, records it as the node's
/// `notify_id` and adds the wait registration to `uow`.
fn park(node: &mut NodeExecution, uow: &mut UnitOfWork, purpose: WaitPurpose) -> String {
    let correlation_id = new_correlation_id();
    node.notify_id = Some(correlation_id.clone());
    uow.register_wait(WaitInstance::new(
        correlation_id.clone(),
        node.id,
        node.plan_execution_id,
        purpose,
    ));
    correlation_id
}

/// Outcome of a parent from its chain-end children.
fn aggregate_children(children: &[NodeExecution]) -> StepOutcome {
    let ends: Vec<&NodeExecution> = children.iter().filter(|c| c.ends_chain()).collect();
    let failed: Vec<&&NodeExecution> = ends.iter().filter(|c| !c.status.is_positive()).collect();

    if failed.is_empty() {
        let summary: Vec<Value> = ends
            .iter()
            .map(|c| {
                json!({
                    "identifier": c.identifier,
                    "status": c.status,
                    "outputs": c.outputs,
                })
            })
            .collect();
        return StepOutcome::succeeded(json!({ "children": summary }));
    }

    let mut failure: Option<FailureInfo> = None;
    for child in failed {
        let message = match &child.failure_info {
            Some(info) => format!("`{}` ended {}: {}", child.identifier, child.status, info.error_message()),
            None => format!("`{}` ended {}", child.identifier, child.status),
        };
        failure = Some(match failure {
            Some(info) => info.with_failure(CHILD_FAILED, message),
            None => FailureInfo::new(CHILD_FAILED, message),
        });
    }
    let outcome =
        StepOutcome::failed(failure.unwrap_or_else(|| FailureInfo::new(CHILD_FAILED, "child failed")));
    if ends
        .iter()
        .any(|c| matches!(c.status, Status::Aborted | Status::Expired))
    {
        outcome.mark_interrupted()
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{Ambiance, FacilitationMode};

    fn child(identifier: &str, status: Status) -> NodeExecution {
        let scope = Ambiance::new(Uuid::new_v4(), HashMap::new());
        let mut node = NodeExecution::new(
            &scope,
            &PlanNode::new(identifier, identifier, "noop").with_facilitation(FacilitationMode::Sync),
        )
        .unwrap();
        node.status = status;
        node
    }

    #[test]
    fn test_aggregate_all_positive() {
        let children = vec![
            child("a", Status::Succeeded),
            child("b", Status::IgnoreFailed),
        ];
        let outcome = aggregate_children(&children);
        assert_eq!(outcome.status, Status::Succeeded);
        assert_eq!(outcome.outputs.unwrap()["children"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_aggregate_lists_failed_chain_ends() {
        let mut middle = child("a", Status::Failed);
        // A failed node that routed on to a successor does not end its chain.
        middle.next_id = Some(Uuid::new_v4());
        let children = vec![
            middle,
            child("b", Status::Aborted),
            child("c", Status::Succeeded),
            child("d", Status::Failed),
        ];
        let outcome = aggregate_children(&children);
        assert_eq!(outcome.status, Status::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.failures.len(), 2);
        assert!(failure.codes().all(|code| code == CHILD_FAILED));
        assert!(failure.error_message().contains("`b` ended aborted"));
        assert!(outcome.interrupted);
    }

    #[test]
    fn test_aggregate_plain_failure_is_advised() {
        let children = vec![child("a", Status::Failed), child("b", Status::Succeeded)];
        let outcome = aggregate_children(&children);
        assert_eq!(outcome.status, Status::Failed);
        assert!(!outcome.interrupted);
    }
}
