//! Step executor trait and related types.
//!
//! A step executor knows how to run one step type. The engine owns everything
//! around it: parameter resolution, the facilitation mode, persistence and the
//! decision of what happens after the step reports back.

use async_trait::async_trait;
use conductor_core::{Ambiance, ExecutableResponse, FailureInfo, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::services::TaskDispatcher;

/// What a step executor sees of the node it runs.
#[derive(Clone)]
pub struct StepContext {
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub identifier: String,
    pub step_type: String,
    pub attempt_id: Uuid,
    pub retry_count: u32,
    pub ambiance: Ambiance,
    /// Resolved once per node; every attempt sees the same snapshot.
    pub parameters: Value,
    /// Plan node ids of the children, for `Child`/`Children` steps.
    pub children: Vec<String>,
    /// Pre-registered correlation id for `Async`/`Task` steps.
    pub correlation_id: Option<String>,
    pub task_dispatcher: Arc<dyn TaskDispatcher>,
}

impl StepContext {
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn str_parameter(&self, key: &str) -> Option<&str> {
        self.parameter(key).and_then(Value::as_str)
    }

    pub fn u64_parameter(&self, key: &str) -> Option<u64> {
        self.parameter(key).and_then(Value::as_u64)
    }

    /// The pre-registered correlation id, or a failure if the step was not given one.
    pub fn require_correlation_id(&self) -> Result<String, FailureInfo> {
        self.correlation_id.clone().ok_or_else(|| {
            FailureInfo::internal(format!(
                "step `{}` needs a correlation id but was not facilitated asynchronously",
                self.identifier
            ))
        })
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs the step. `Err` is a step failure and goes to the advisers.
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo>;

    /// Turns the payload delivered by a notify into the step's result.
    async fn handle_response(&self, _ctx: &StepContext, response: &Value) -> Result<Value, FailureInfo> {
        outcome_from_response(response)
    }
}

/// Reads the conventional response shape:
/// `{"status": "succeeded" | "failed", "outputs": {..}, "failure": {"code", "message"}}`.
/// A response without a status counts as success with itself as outputs.
pub fn outcome_from_response(response: &Value) -> Result<Value, FailureInfo> {
    let status = response.get("status").and_then(Value::as_str);
    match status {
        Some("failed") | Some("error") => {
            let failure = response.get("failure");
            let code = failure
                .and_then(|f| f.get("code"))
                .and_then(Value::as_str)
                .unwrap_or("TASK_FAILED");
            let message = failure
                .and_then(|f| f.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("task reported failure");
            Err(FailureInfo::new(code, message))
        }
        Some(_) => Ok(response.get("outputs").cloned().unwrap_or(Value::Null)),
        None => Ok(response.clone()),
    }
}

/// A step result on its way to the advisers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: Status,
    pub outputs: Option<Value>,
    pub failure: Option<FailureInfo>,
    /// Set when a child was ended by an abort or expiry. Advisers are skipped
    /// and the node fails as is.
    #[serde(default)]
    pub interrupted: bool,
}

impl StepOutcome {
    pub fn succeeded(outputs: Value) -> Self {
        Self {
            status: Status::Succeeded,
            outputs: Some(outputs),
            failure: None,
            interrupted: false,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            outputs: None,
            failure: Some(failure),
            interrupted: false,
        }
    }

    pub fn mark_interrupted(mut self) -> Self {
        self.interrupted = true;
        self
    }

    pub fn from_result(result: Result<Value, FailureInfo>) -> Self {
        match result {
            Ok(outputs) => Self::succeeded(outputs),
            Err(failure) => Self::failed(failure),
        }
    }
}
