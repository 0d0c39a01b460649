use conductor_core::{NodeExecution, PlanExecution, PlanStatus, Status};
use db::ExecutionStore;
use events::{Event, NodeEventData};
use std::sync::Arc;
use tracing::{debug, info};

use crate::advisers::AdviserEngine;
use crate::config::EngineConfig;
use crate::core::OrderedEventEmitter;
use crate::error::Result;
use crate::services::{InProcessTaskDispatcher, ParameterResolver, TaskDispatcher, TemplateResolver};
use crate::state_machine::{NodeStateMachine, PlanStateMachine};
use crate::steps::StepRegistry;
use crate::wait_notify::WaitNotifyService;

/// Everything the engine, the interrupt manager and the sweeper share.
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: ExecutionStore,
    pub steps: StepRegistry,
    pub advisers: AdviserEngine,
    pub resolver: Arc<dyn ParameterResolver>,
    pub task_dispatcher: Arc<dyn TaskDispatcher>,
    pub wait_notify: WaitNotifyService,
    pub emitter: Option<OrderedEventEmitter>,
}

impl EngineContext {
    /// Context with the built-in steps, the template resolver and an
    /// in-process task dispatcher.
    pub fn new(store: ExecutionStore, config: EngineConfig) -> Self {
        let wait_notify = WaitNotifyService::new(store.clone());
        let task_dispatcher = Arc::new(InProcessTaskDispatcher::new(wait_notify.clone()));
        Self {
            config,
            store,
            steps: StepRegistry::with_builtins(),
            advisers: AdviserEngine::new(),
            resolver: Arc::new(TemplateResolver::new()),
            task_dispatcher,
            wait_notify,
            emitter: None,
        }
    }

    pub fn with_steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_task_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.task_dispatcher = dispatcher;
        self
    }

    pub fn with_emitter(mut self, emitter: OrderedEventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validates and applies a node status change in memory. The caller persists it.
    pub fn transition(&self, node: &mut NodeExecution, to: Status) -> Result<Status> {
        let from = node.status;
        NodeStateMachine::validate_transition(&from, &to)?;
        debug!(
            node_execution_id = %node.id,
            from = %from,
            to = %to,
            "Node state transition"
        );
        node.status = to;
        node.updated_at = chrono::Utc::now();
        Ok(from)
    }

    pub fn validate_plan_transition(&self, plan: &PlanExecution, to: PlanStatus) -> Result<()> {
        PlanStateMachine::validate_transition(&plan.status, &to)
    }

    pub fn emit_event(&self, event: Event) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }

    pub fn emit_status_update(&self, node: &NodeExecution, from_status: Status) {
        self.emit_event(Event::NodeStatusUpdate {
            node: NodeEventData::from(node),
            from_status,
        });
        if node.is_terminal() {
            self.emit_event(Event::NodeEnd {
                node: NodeEventData::from(node),
            });
        }
    }

    pub fn emit_plan_end(&self, plan_execution_id: uuid::Uuid, status: PlanStatus) {
        info!(plan_execution_id = %plan_execution_id, status = %status, "Plan execution ended");
        self.emit_event(Event::PlanEnd {
            plan_execution_id,
            status,
        });
    }
}
