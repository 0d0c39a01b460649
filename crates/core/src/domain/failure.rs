use serde::{Deserialize, Serialize};

/// Failure code used when the engine itself, not the step, failed a node.
pub const ENGINE_INTERNAL_ERROR: &str = "ENGINE_INTERNAL_ERROR";
/// Failure code used when the parameter resolver rejected a node's inputs.
pub const EXPRESSION_ERROR: &str = "EXPRESSION_ERROR";
/// Failure code reported by a parent whose children did not all succeed.
pub const CHILD_FAILED: &str = "CHILD_FAILED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureData {
    pub code: String,
    pub message: String,
}

/// Failure details produced by a step, carried to the adviser as data.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureInfo {
    pub failures: Vec<FailureData>,
}

impl FailureInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failures: vec![FailureData {
                code: code.into(),
                message: message.into(),
            }],
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ENGINE_INTERNAL_ERROR, message)
    }

    pub fn with_failure(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.push(FailureData {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.code.as_str())
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.codes().any(|c| c == code)
    }

    pub fn error_message(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.code, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_codes_and_message() {
        let info = FailureInfo::new("E1", "connection refused").with_failure("E2", "timeout");
        assert!(info.has_code("E1"));
        assert!(info.has_code("E2"));
        assert!(!info.has_code("E3"));
        assert_eq!(info.error_message(), "E1: connection refused; E2: timeout");
    }

    #[test]
    fn test_internal_failure() {
        let info = FailureInfo::internal("no executor for `deploy`");
        assert!(info.has_code(ENGINE_INTERNAL_ERROR));
    }
}
