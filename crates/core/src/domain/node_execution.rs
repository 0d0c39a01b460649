//! The durable, mutable record of one run of one plan node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ambiance::Ambiance;
use super::failure::FailureInfo;
use super::interrupt::InterruptEffect;
use super::plan::{FacilitationMode, PlanNode};
use super::status::Status;
use crate::error::CoreError;

/// How a step handed control back to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync {
        #[serde(default)]
        outputs: serde_json::Value,
    },
    /// Waiting on `callback_id`; with `resume_after_ms` the engine schedules the
    /// notification itself.
    Async {
        callback_id: String,
        #[serde(default)]
        resume_after_ms: Option<u64>,
    },
    Task {
        task_id: String,
        callback_id: String,
    },
    Child {
        child_node_id: String,
    },
    Children {
        child_node_ids: Vec<String>,
    },
}

impl ExecutableResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::Async { .. } => "async",
            Self::Task { .. } => "task",
            Self::Child { .. } => "child",
            Self::Children { .. } => "children",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Task { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Whether this response is a legal reply for a node declared with `mode`.
    pub fn fits(&self, mode: FacilitationMode) -> bool {
        matches!(
            (self, mode),
            (Self::Sync { .. }, FacilitationMode::Sync)
                | (Self::Async { .. }, FacilitationMode::Async)
                | (Self::Task { .. }, FacilitationMode::Task)
                | (Self::Async { .. }, FacilitationMode::Task)
                | (Self::Child { .. }, FacilitationMode::Child)
                | (Self::Children { .. }, FacilitationMode::Children)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: String,
    pub facilitation: FacilitationMode,
    pub ambiance: Ambiance,
    /// Snapshot taken once before the first dispatch; retries reuse it.
    pub resolved_parameters: Option<serde_json::Value>,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expiry_at: Option<DateTime<Utc>>,
    pub notify_id: Option<String>,
    pub parent_id: Option<Uuid>,
    pub next_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub attempt_id: Uuid,
    pub retry_ids: Vec<Uuid>,
    pub interrupt_history: Vec<InterruptEffect>,
    pub executable_response: Option<ExecutableResponse>,
    /// Branches still running under this node; persisted so fan-in survives restarts.
    pub pending_children: i64,
    pub failure_info: Option<FailureInfo>,
    pub outputs: Option<serde_json::Value>,
    pub adviser_expired: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecution {
    /// Creates a queued execution of `plan_node` inside the scope `scope`.
    pub fn new(scope: &Ambiance, plan_node: &PlanNode) -> Result<Self, CoreError> {
        let attempt_id = Uuid::new_v4();
        let ambiance = scope.clone_for_child().add_level(plan_node.level(attempt_id))?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            plan_execution_id: scope.plan_execution_id,
            plan_node_id: plan_node.id.clone(),
            identifier: plan_node.identifier.clone(),
            step_type: plan_node.step_type.clone(),
            facilitation: plan_node.facilitation,
            ambiance,
            resolved_parameters: None,
            status: Status::Queued,
            started_at: None,
            ended_at: None,
            expiry_at: None,
            notify_id: None,
            parent_id: None,
            next_id: None,
            previous_id: None,
            attempt_id,
            retry_ids: Vec::new(),
            interrupt_history: Vec::new(),
            executable_response: None,
            pending_children: 0,
            failure_info: None,
            outputs: None,
            adviser_expired: false,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Uuid) -> Self {
        self.previous_id = Some(previous_id);
        self
    }

    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Begins a new attempt: the current attempt id moves to `retry_ids` and the
    /// current level is replaced by one carrying the new runtime id.
    pub fn start_new_attempt(&mut self) -> Result<Uuid, CoreError> {
        let mut level = self
            .ambiance
            .current_level()
            .cloned()
            .ok_or(CoreError::EmptyLevelStack)?;
        let attempt_id = Uuid::new_v4();
        level.runtime_id = attempt_id.to_string();

        self.ambiance = self.ambiance.clone_for_finish()?.add_level(level)?;
        self.retry_ids.push(self.attempt_id);
        self.attempt_id = attempt_id;
        self.notify_id = None;
        self.executable_response = None;
        self.outputs = None;
        Ok(attempt_id)
    }

    /// Whether `self` was spawned by the current attempt of `parent`.
    pub fn belongs_to_attempt_of(&self, parent: &NodeExecution) -> bool {
        self.parent_id == Some(parent.id)
            && self
                .ambiance
                .parent_level()
                .is_some_and(|level| level.runtime_id == parent.attempt_id.to_string())
    }

    /// A node ends its chain when it is terminal and has no successor.
    pub fn ends_chain(&self) -> bool {
        self.is_terminal() && self.next_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::interrupt::InterruptType;
    use std::collections::HashMap;

    fn scope() -> Ambiance {
        Ambiance::new(Uuid::new_v4(), HashMap::new())
    }

    #[test]
    fn test_new_node_execution() {
        let scope = scope();
        let plan_node = PlanNode::new("build", "build", "noop");
        let node = NodeExecution::new(&scope, &plan_node).unwrap();

        assert_eq!(node.status, Status::Queued);
        assert_eq!(node.plan_execution_id, scope.plan_execution_id);
        assert_eq!(node.retry_count(), 0);
        let level = node.ambiance.current_level().unwrap();
        assert_eq!(level.setup_id, "build");
        assert_eq!(level.runtime_id, node.attempt_id.to_string());
        assert!(scope.levels().is_empty());
    }

    #[test]
    fn test_new_attempt_keeps_setup_id() {
        let plan_node = PlanNode::new("build", "build", "noop");
        let mut node = NodeExecution::new(&scope(), &plan_node).unwrap();
        let first_attempt = node.attempt_id;
        node.notify_id = Some("cid".into());

        let second = node.start_new_attempt().unwrap();

        assert_eq!(node.retry_ids, vec![first_attempt]);
        assert_eq!(node.retry_count(), 1);
        assert_eq!(node.attempt_id, second);
        assert!(node.notify_id.is_none());
        let level = node.ambiance.current_level().unwrap();
        assert_eq!(level.setup_id, "build");
        assert_eq!(level.runtime_id, second.to_string());
        assert_eq!(node.ambiance.levels().len(), 1);
    }

    #[test]
    fn test_interrupt_history_is_per_attempt() {
        let plan_node = PlanNode::new("build", "build", "noop");
        let mut node = NodeExecution::new(&scope(), &plan_node).unwrap();
        node.interrupt_history.push(InterruptEffect::new(
            Uuid::new_v4(),
            InterruptType::Retry,
            node.attempt_id,
            Status::Running,
            Status::Running,
        ));
        let first_attempt = node.attempt_id;

        node.start_new_attempt().unwrap();
        assert_eq!(node.interrupt_history.len(), 1);
        assert_eq!(node.interrupt_history[0].attempt_id, first_attempt);
        assert_ne!(node.attempt_id, first_attempt);
    }

    #[test]
    fn test_children_belong_to_current_attempt() {
        let parent_plan = PlanNode::new("stage", "stage", "parallel")
            .with_facilitation(FacilitationMode::Children);
        let child_plan = PlanNode::new("step", "step", "noop");
        let mut parent = NodeExecution::new(&scope(), &parent_plan).unwrap();

        let child = NodeExecution::new(&parent.ambiance, &child_plan)
            .unwrap()
            .with_parent(Some(parent.id));
        assert!(child.belongs_to_attempt_of(&parent));

        parent.start_new_attempt().unwrap();
        assert!(!child.belongs_to_attempt_of(&parent));
    }

    #[test]
    fn test_response_fits_mode() {
        let response = ExecutableResponse::Async {
            callback_id: "cid".into(),
            resume_after_ms: None,
        };
        assert!(response.fits(FacilitationMode::Async));
        assert!(response.fits(FacilitationMode::Task));
        assert!(!response.fits(FacilitationMode::Sync));

        let response = ExecutableResponse::Task {
            task_id: "t-1".into(),
            callback_id: "cid".into(),
        };
        assert_eq!(response.task_id(), Some("t-1"));
        assert!(!response.fits(FacilitationMode::Children));
    }
}
