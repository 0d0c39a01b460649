//! Orchestration event types

use chrono::{DateTime, Utc};
use conductor_core::{Ambiance, InterruptType, NodeExecution, PlanStatus, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Emitter-assigned position; strictly increasing per emitter
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self::with_sequence(event, 0)
    }

    pub fn with_sequence(event: Event, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    #[serde(rename = "plan.start")]
    PlanStart,
    #[serde(rename = "plan.end")]
    PlanEnd,
    #[serde(rename = "node.start")]
    NodeStart,
    #[serde(rename = "node.status_update")]
    NodeStatusUpdate,
    #[serde(rename = "node.advised")]
    NodeAdvised,
    #[serde(rename = "node.end")]
    NodeEnd,
    #[serde(rename = "interrupt.applied")]
    InterruptApplied,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        Self::PlanStart,
        Self::PlanEnd,
        Self::NodeStart,
        Self::NodeStatusUpdate,
        Self::NodeAdvised,
        Self::NodeEnd,
        Self::InterruptApplied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanStart => "plan.start",
            Self::PlanEnd => "plan.end",
            Self::NodeStart => "node.start",
            Self::NodeStatusUpdate => "node.status_update",
            Self::NodeAdvised => "node.advised",
            Self::NodeEnd => "node.end",
            Self::InterruptApplied => "interrupt.applied",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All events emitted by the engine. Always published after the change they
/// describe has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "plan.start")]
    PlanStart {
        plan_execution_id: Uuid,
        plan_name: String,
    },

    #[serde(rename = "plan.end")]
    PlanEnd {
        plan_execution_id: Uuid,
        status: PlanStatus,
    },

    #[serde(rename = "node.start")]
    NodeStart { node: NodeEventData },

    #[serde(rename = "node.status_update")]
    NodeStatusUpdate {
        node: NodeEventData,
        from_status: Status,
    },

    /// An adviser (or the pass-through default) decided what happens next
    #[serde(rename = "node.advised")]
    NodeAdvised { node: NodeEventData, advice: String },

    #[serde(rename = "node.end")]
    NodeEnd { node: NodeEventData },

    #[serde(rename = "interrupt.applied")]
    InterruptApplied {
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        interrupt_id: Uuid,
        interrupt_type: InterruptType,
    },
}

/// Snapshot of a node execution carried by node events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEventData {
    pub plan_execution_id: Uuid,
    pub node_execution_id: Uuid,
    pub identifier: String,
    pub step_type: String,
    pub status: Status,
    pub ambiance: Ambiance,
}

impl From<&NodeExecution> for NodeEventData {
    fn from(node: &NodeExecution) -> Self {
        Self {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: node.id,
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            status: node.status,
            ambiance: node.ambiance.clone(),
        }
    }
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PlanStart { .. } => EventType::PlanStart,
            Event::PlanEnd { .. } => EventType::PlanEnd,
            Event::NodeStart { .. } => EventType::NodeStart,
            Event::NodeStatusUpdate { .. } => EventType::NodeStatusUpdate,
            Event::NodeAdvised { .. } => EventType::NodeAdvised,
            Event::NodeEnd { .. } => EventType::NodeEnd,
            Event::InterruptApplied { .. } => EventType::InterruptApplied,
        }
    }

    fn node(&self) -> Option<&NodeEventData> {
        match self {
            Event::NodeStart { node }
            | Event::NodeStatusUpdate { node, .. }
            | Event::NodeAdvised { node, .. }
            | Event::NodeEnd { node } => Some(node),
            _ => None,
        }
    }

    pub fn plan_execution_id(&self) -> Uuid {
        match self {
            Event::PlanStart {
                plan_execution_id, ..
            }
            | Event::PlanEnd {
                plan_execution_id, ..
            }
            | Event::InterruptApplied {
                plan_execution_id, ..
            } => *plan_execution_id,
            Event::NodeStart { node }
            | Event::NodeStatusUpdate { node, .. }
            | Event::NodeAdvised { node, .. }
            | Event::NodeEnd { node } => node.plan_execution_id,
        }
    }

    pub fn node_execution_id(&self) -> Option<Uuid> {
        match self {
            Event::InterruptApplied {
                node_execution_id, ..
            } => *node_execution_id,
            other => other.node().map(|n| n.node_execution_id),
        }
    }

    pub fn step_type(&self) -> Option<&str> {
        self.node().map(|n| n.step_type.as_str())
    }

    pub fn status(&self) -> Option<Status> {
        self.node().map(|n| n.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::PlanNode;
    use std::collections::HashMap;

    fn node_data() -> NodeEventData {
        let scope = Ambiance::new(Uuid::new_v4(), HashMap::new());
        let node = NodeExecution::new(&scope, &PlanNode::new("build", "build", "shell")).unwrap();
        NodeEventData::from(&node)
    }

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::with_sequence(
            Event::PlanStart {
                plan_execution_id: Uuid::new_v4(),
                plan_name: "release".to_string(),
            },
            3,
        );

        assert!(!envelope.id.is_nil());
        assert_eq!(envelope.sequence, 3);
        assert!(envelope.timestamp <= Utc::now());
        assert_eq!(envelope.event_type(), EventType::PlanStart);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::NodeStatusUpdate {
            node: node_data(),
            from_status: Status::Queued,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("node.status_update"));
        assert!(json.contains("from_status"));
        assert!(json.contains("\"step_type\":\"shell\""));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"plan.end","plan_execution_id":"550e8400-e29b-41d4-a716-446655440000","status":"aborted"}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::PlanEnd { status, .. } => assert_eq!(status, PlanStatus::Aborted),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_accessors() {
        let data = node_data();
        let node_id = data.node_execution_id;
        let plan_id = data.plan_execution_id;
        let event = Event::NodeEnd { node: data };
        assert_eq!(event.node_execution_id(), Some(node_id));
        assert_eq!(event.plan_execution_id(), plan_id);
        assert_eq!(event.step_type(), Some("shell"));
        assert_eq!(event.status(), Some(Status::Queued));

        let plan_event = Event::PlanEnd {
            plan_execution_id: plan_id,
            status: PlanStatus::Succeeded,
        };
        assert_eq!(plan_event.node_execution_id(), None);
        assert_eq!(plan_event.step_type(), None);
    }

    #[test]
    fn test_event_type_names() {
        for event_type in EventType::ALL {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
    }
}
