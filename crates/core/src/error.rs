use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Malformed level: {0}")]
    MalformedLevel(String),

    #[error("Cannot leave scope: ambiance has no levels")]
    EmptyLevelStack,

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn invalid_plan(reason: impl Into<String>) -> Self {
        Self::InvalidPlan(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::invalid_plan("start node `build` is missing");
        assert!(error.to_string().contains("build"));
        assert_eq!(
            CoreError::EmptyLevelStack.to_string(),
            "Cannot leave scope: ambiance has no levels"
        );
    }
}
