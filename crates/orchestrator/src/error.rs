use conductor_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Optimistic concurrency check failed; the caller re-reads and retries.
    #[error("Concurrent modification of {id}")]
    ConcurrentModification { id: Uuid },

    #[error("Invalid interrupt: {0}")]
    InvalidInterrupt(String),

    /// The engine reached a state it cannot continue from for this node.
    #[error("Engine invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(db::DbError),

    #[error("Task dispatch failed: {0}")]
    TaskDispatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<db::DbError> for OrchestratorError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::Conflict { id } => Self::ConcurrentModification { id },
            db::DbError::PlanExecutionNotFound(id) => {
                Self::NotFound(format!("plan execution {id}"))
            }
            db::DbError::NodeExecutionNotFound(id) => {
                Self::NotFound(format!("node execution {id}"))
            }
            other => Self::Database(other),
        }
    }
}

impl OrchestratorError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    pub fn invalid_interrupt(message: impl Into<String>) -> Self {
        Self::InvalidInterrupt(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Errors that will not go away by retrying the same work item.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_)
                | Self::InvalidTransition { .. }
                | Self::Core(CoreError::EmptyLevelStack)
                | Self::Core(CoreError::MalformedLevel(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
