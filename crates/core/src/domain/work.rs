//! Entries of the durable work queue.
//!
//! Workers never hold state between items: everything a worker needs to pick
//! up where another left off is either in the item or in the node record it
//! points to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    StartNode,
    ResumeNode,
    ChildrenCompleted,
    /// A durable timer; claiming it delivers a notify for its correlation id.
    DelayElapsed,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartNode => "start_node",
            Self::ResumeNode => "resume_node",
            Self::ChildrenCompleted => "children_completed",
            Self::DelayElapsed => "delay_elapsed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start_node" => Some(Self::StartNode),
            "resume_node" => Some(Self::ResumeNode),
            "children_completed" => Some(Self::ChildrenCompleted),
            "delay_elapsed" => Some(Self::DelayElapsed),
            _ => None,
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: WorkKind,
    pub node_execution_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub ready_at: DateTime<Utc>,
    pub attempts: i64,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    fn new(kind: WorkKind, node_execution_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            node_execution_id,
            payload,
            ready_at: now,
            attempts: 0,
            claimed_by: None,
            claimed_until: None,
            created_at: now,
        }
    }

    pub fn start_node(node_execution_id: Uuid) -> Self {
        Self::new(WorkKind::StartNode, Some(node_execution_id), serde_json::Value::Null)
    }

    pub fn resume_node(node_execution_id: Uuid, correlation_id: &str) -> Self {
        Self::new(
            WorkKind::ResumeNode,
            Some(node_execution_id),
            serde_json::json!({ "correlation_id": correlation_id }),
        )
    }

    /// Starts attempt `attempt_id` of a node that is already running (a retry).
    pub fn start_attempt(node_execution_id: Uuid, attempt_id: Uuid) -> Self {
        Self::new(
            WorkKind::StartNode,
            Some(node_execution_id),
            serde_json::json!({ "attempt_id": attempt_id }),
        )
    }

    /// Resumes a node with a step outcome that could not be applied when it arrived.
    pub fn resume_with_outcome(
        node_execution_id: Uuid,
        attempt_id: Uuid,
        outcome: serde_json::Value,
    ) -> Self {
        Self::new(
            WorkKind::ResumeNode,
            Some(node_execution_id),
            serde_json::json!({ "attempt_id": attempt_id, "outcome": outcome }),
        )
    }

    pub fn children_completed(node_execution_id: Uuid) -> Self {
        Self::new(
            WorkKind::ChildrenCompleted,
            Some(node_execution_id),
            serde_json::Value::Null,
        )
    }

    pub fn delay_elapsed(correlation_id: &str, ready_at: DateTime<Utc>) -> Self {
        Self::new(
            WorkKind::DelayElapsed,
            None,
            serde_json::json!({ "correlation_id": correlation_id }),
        )
        .with_ready_at(ready_at)
    }

    pub fn with_ready_at(mut self, ready_at: DateTime<Utc>) -> Self {
        self.ready_at = ready_at;
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.get("correlation_id").and_then(|v| v.as_str())
    }

    pub fn attempt_id(&self) -> Option<Uuid> {
        self.payload
            .get("attempt_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn outcome(&self) -> Option<&serde_json::Value> {
        self.payload.get("outcome")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_kind_strings() {
        for kind in [
            WorkKind::StartNode,
            WorkKind::ResumeNode,
            WorkKind::ChildrenCompleted,
            WorkKind::DelayElapsed,
        ] {
            assert_eq!(WorkKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(WorkKind::parse("bogus"), None);
    }

    #[test]
    fn test_delay_elapsed_carries_correlation() {
        let ready_at = Utc::now() + chrono::Duration::seconds(10);
        let item = WorkItem::delay_elapsed("cid-1", ready_at);
        assert_eq!(item.kind, WorkKind::DelayElapsed);
        assert_eq!(item.correlation_id(), Some("cid-1"));
        assert_eq!(item.ready_at, ready_at);
        assert!(item.node_execution_id.is_none());

        let start = WorkItem::start_node(Uuid::new_v4());
        assert!(start.correlation_id().is_none());
        assert!(start.attempt_id().is_none());
    }

    #[test]
    fn test_attempt_payloads() {
        let node = Uuid::new_v4();
        let attempt = Uuid::new_v4();
        let retry = WorkItem::start_attempt(node, attempt);
        assert_eq!(retry.kind, WorkKind::StartNode);
        assert_eq!(retry.attempt_id(), Some(attempt));

        let stashed = WorkItem::resume_with_outcome(node, attempt, serde_json::json!({"status": "failed"}));
        assert_eq!(stashed.kind, WorkKind::ResumeNode);
        assert_eq!(stashed.attempt_id(), Some(attempt));
        assert!(stashed.correlation_id().is_none());
        assert_eq!(stashed.outcome().unwrap()["status"], "failed");
    }
}
