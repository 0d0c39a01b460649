use async_trait::async_trait;
use conductor_core::{ExecutableResponse, FailureInfo};
use serde_json::{json, Value};

use crate::core::{StepContext, StepExecutor};

/// Succeeds immediately. Outputs the `outputs` parameter, or all parameters.
pub struct NoopStep;

#[async_trait]
impl StepExecutor for NoopStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        let outputs = ctx
            .parameter("outputs")
            .cloned()
            .unwrap_or_else(|| ctx.parameters.clone());
        Ok(ExecutableResponse::Sync { outputs })
    }
}

/// Fails with `code`/`message`. With `succeed_on_attempt: n` the n-th attempt
/// (1-based) and later ones succeed.
pub struct FailStep;

#[async_trait]
impl StepExecutor for FailStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        let attempt = u64::from(ctx.retry_count) + 1;
        if ctx
            .u64_parameter("succeed_on_attempt")
            .is_some_and(|n| attempt >= n)
        {
            return Ok(ExecutableResponse::Sync {
                outputs: json!({ "attempt": attempt }),
            });
        }
        Err(FailureInfo::new(
            ctx.str_parameter("code").unwrap_or("STEP_FAILED"),
            ctx.str_parameter("message").unwrap_or("step failed"),
        ))
    }
}

/// Parks the node until someone notifies its correlation id.
pub struct WaitStep;

#[async_trait]
impl StepExecutor for WaitStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        Ok(ExecutableResponse::Async {
            callback_id: ctx.require_correlation_id()?,
            resume_after_ms: ctx.u64_parameter("timeout_ms"),
        })
    }
}

/// Parks the node for `duration_ms` using a durable delay.
pub struct SleepStep;

#[async_trait]
impl StepExecutor for SleepStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        Ok(ExecutableResponse::Async {
            callback_id: ctx.require_correlation_id()?,
            resume_after_ms: Some(ctx.u64_parameter("duration_ms").unwrap_or(0)),
        })
    }

    async fn handle_response(&self, ctx: &StepContext, _response: &Value) -> Result<Value, FailureInfo> {
        Ok(json!({ "slept_ms": ctx.u64_parameter("duration_ms").unwrap_or(0) }))
    }
}

/// Hands the parameters to the task dispatcher; completion arrives as a notify.
pub struct TaskStep;

#[async_trait]
impl StepExecutor for TaskStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        let callback_id = ctx.require_correlation_id()?;
        let task_id = ctx
            .task_dispatcher
            .submit_task_async(ctx.parameters.clone(), &callback_id)
            .await
            .map_err(|e| FailureInfo::new("TASK_DISPATCH_FAILED", e.to_string()))?;
        Ok(ExecutableResponse::Task {
            task_id,
            callback_id,
        })
    }
}

/// Runs its single child chain.
pub struct SectionStep;

#[async_trait]
impl StepExecutor for SectionStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        let child_node_id = ctx.children.first().cloned().ok_or_else(|| {
            FailureInfo::internal(format!("section `{}` has no child", ctx.identifier))
        })?;
        Ok(ExecutableResponse::Child { child_node_id })
    }
}

/// Runs every child chain concurrently and completes when all have ended.
pub struct ParallelStep;

#[async_trait]
impl StepExecutor for ParallelStep {
    async fn execute(&self, ctx: &StepContext) -> Result<ExecutableResponse, FailureInfo> {
        Ok(ExecutableResponse::Children {
            child_node_ids: ctx.children.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::TaskDispatcher;
    use crate::error::{OrchestratorError, Result};
    use conductor_core::Ambiance;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    struct RejectingDispatcher;

    #[async_trait]
    impl TaskDispatcher for RejectingDispatcher {
        async fn submit_task(&self, _payload: Value, _timeout: Duration) -> Result<String> {
            Err(OrchestratorError::TaskDispatch("offline".into()))
        }

        async fn submit_task_async(&self, _payload: Value, _correlation_id: &str) -> Result<String> {
            Err(OrchestratorError::TaskDispatch("offline".into()))
        }

        async fn abort_task(&self, _task_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn ctx(parameters: Value, correlation_id: Option<&str>) -> StepContext {
        StepContext {
            node_execution_id: Uuid::new_v4(),
            plan_execution_id: Uuid::new_v4(),
            identifier: "step".into(),
            step_type: "test".into(),
            attempt_id: Uuid::new_v4(),
            retry_count: 0,
            ambiance: Ambiance::new(Uuid::new_v4(), HashMap::new()),
            parameters,
            children: vec!["a".into(), "b".into()],
            correlation_id: correlation_id.map(str::to_string),
            task_dispatcher: Arc::new(RejectingDispatcher),
        }
    }

    #[tokio::test]
    async fn test_fail_step_succeeds_on_later_attempt() {
        let mut context = ctx(json!({"code": "E1", "succeed_on_attempt": 2}), None);
        let failure = FailStep.execute(&context).await.unwrap_err();
        assert!(failure.has_code("E1"));

        context.retry_count = 1;
        assert!(FailStep.execute(&context).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_step_requires_correlation_id() {
        let failure = WaitStep.execute(&ctx(json!({}), None)).await.unwrap_err();
        assert!(failure.has_code(conductor_core::ENGINE_INTERNAL_ERROR));

        let response = WaitStep.execute(&ctx(json!({}), Some("cid"))).await.unwrap();
        assert_eq!(
            response,
            ExecutableResponse::Async {
                callback_id: "cid".into(),
                resume_after_ms: None
            }
        );
    }

    #[tokio::test]
    async fn test_task_dispatch_failure_is_step_failure() {
        let failure = TaskStep
            .execute(&ctx(json!({}), Some("cid")))
            .await
            .unwrap_err();
        assert!(failure.has_code("TASK_DISPATCH_FAILED"));
    }

    #[tokio::test]
    async fn test_parallel_and_section() {
        let context = ctx(json!({}), None);
        assert_eq!(
            ParallelStep.execute(&context).await.unwrap(),
            ExecutableResponse::Children {
                child_node_ids: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(
            SectionStep.execute(&context).await.unwrap(),
            ExecutableResponse::Child {
                child_node_id: "a".into()
            }
        );
    }
}
