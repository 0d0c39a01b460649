use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::status::Status;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    Abort,
    AbortAll,
    Pause,
    Resume,
    Retry,
    /// Issued by the expiry sweep only.
    Expire,
}

impl InterruptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::AbortAll => "abort_all",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::Expire => "expire",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "abort" => Some(Self::Abort),
            "abort_all" => Some(Self::AbortAll),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "retry" => Some(Self::Retry),
            "expire" => Some(Self::Expire),
            _ => None,
        }
    }

    pub fn is_user_issuable(&self) -> bool {
        !matches!(self, Self::Expire)
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one interrupt applied to one node attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub attempt_id: Uuid,
    pub from_status: Status,
    pub to_status: Status,
    pub applied_at: DateTime<Utc>,
}

impl InterruptEffect {
    pub fn new(
        interrupt_id: Uuid,
        interrupt_type: InterruptType,
        attempt_id: Uuid,
        from_status: Status,
        to_status: Status,
    ) -> Self {
        Self {
            interrupt_id,
            interrupt_type,
            attempt_id,
            from_status,
            to_status,
            applied_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterruptState {
    #[default]
    Registered,
    Processed,
    Discarded,
}

impl InterruptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Processed => "processed",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(Self::Registered),
            "processed" => Some(Self::Processed),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// Durable record of an operator or system interrupt request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interrupt {
    pub id: Uuid,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: Uuid,
    pub node_execution_id: Option<Uuid>,
    pub state: InterruptState,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Interrupt {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            interrupt_type,
            plan_execution_id,
            node_execution_id,
            state: InterruptState::Registered,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}
