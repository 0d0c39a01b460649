use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitPurpose {
    #[default]
    AsyncStep,
    RetryDelay,
}

impl WaitPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsyncStep => "async_step",
            Self::RetryDelay => "retry_delay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "async_step" => Some(Self::AsyncStep),
            "retry_delay" => Some(Self::RetryDelay),
            _ => None,
        }
    }
}

/// A registered correlation id a node is parked on. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitInstance {
    pub correlation_id: String,
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub purpose: WaitPurpose,
    pub context: HashMap<String, String>,
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl WaitInstance {
    pub fn new(
        correlation_id: impl Into<String>,
        node_execution_id: Uuid,
        plan_execution_id: Uuid,
        purpose: WaitPurpose,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            node_execution_id,
            plan_execution_id,
            purpose,
            context: HashMap::new(),
            response: None,
            created_at: Utc::now(),
            consumed_at: None,
        }
    }

    pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
