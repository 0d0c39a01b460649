use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A conditional update matched no row: status or version moved underneath us.
    #[error("Concurrent modification of {id}")]
    Conflict { id: Uuid },

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(Uuid),

    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),
}

impl DbError {
    pub fn corrupt(what: impl Into<String>) -> Self {
        Self::Corrupt(what.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
