use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Queued,
    Running,
    /// Paused by an operator; resumption is deferred until a resume interrupt.
    Suspended,
    Succeeded,
    Failed,
    /// A failure an adviser decided to ignore.
    IgnoreFailed,
    Aborted,
    Expired,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::IgnoreFailed => "ignore_failed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "ignore_failed" => Some(Self::IgnoreFailed),
            "aborted" => Some(Self::Aborted),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running | Self::Suspended)
    }

    /// Terminal statuses that let the surrounding scope carry on as a success.
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Succeeded | Self::IgnoreFailed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a whole plan execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Running,
    Paused,
    Succeeded,
    Failed,
    Aborted,
    Expired,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::Paused)
    }

    /// Plan status reached when the root chain ends with the given node status.
    pub fn from_node_status(status: Status) -> Self {
        match status {
            Status::Succeeded | Status::IgnoreFailed => Self::Succeeded,
            Status::Aborted => Self::Aborted,
            Status::Expired => Self::Expired,
            Status::Failed => Self::Failed,
            Status::Queued | Status::Running | Status::Suspended => Self::Running,
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
