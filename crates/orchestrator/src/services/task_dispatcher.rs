//! Dispatch of step work to something outside the engine.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::wait_notify::WaitNotifyService;

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Runs a task and waits at most `timeout` for it to finish.
    async fn submit_task(&self, payload: Value, timeout: Duration) -> Result<String>;

    /// Starts a task whose completion is delivered later as a notify on `correlation_id`.
    async fn submit_task_async(&self, payload: Value, correlation_id: &str) -> Result<String>;

    /// Asks the task to stop. Completion, if any, is still delivered as a notify.
    async fn abort_task(&self, task_id: &str) -> Result<()>;
}

/// Runs task payloads as tokio tasks in this process.
///
/// Payload fields: `sleep_ms` (simulated duration), `outputs` (returned on
/// success), and `fail: {"code", "message"}` to report a failure instead.
#[derive(Clone)]
pub struct InProcessTaskDispatcher {
    wait_notify: WaitNotifyService,
    running: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl InProcessTaskDispatcher {
    pub fn new(wait_notify: WaitNotifyService) -> Self {
        Self {
            wait_notify,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn run_payload(payload: Value) -> Value {
        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(failure) = payload.get("fail") {
            return json!({ "status": "failed", "failure": failure });
        }
        json!({
            "status": "succeeded",
            "outputs": payload.get("outputs").cloned().unwrap_or(Value::Null),
        })
    }
}

#[async_trait]
impl TaskDispatcher for InProcessTaskDispatcher {
    async fn submit_task(&self, payload: Value, timeout: Duration) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        match tokio::time::timeout(timeout, Self::run_payload(payload)).await {
            Ok(result) => {
                debug!(task_id = %task_id, status = ?result.get("status"), "Task finished");
                Ok(task_id)
            }
            Err(_) => Err(OrchestratorError::TaskDispatch(format!(
                "task {task_id} did not finish within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn submit_task_async(&self, payload: Value, correlation_id: &str) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let wait_notify = self.wait_notify.clone();
        let correlation_id = correlation_id.to_string();
        let tracked = Arc::clone(&self.running);
        let own_id = task_id.clone();

        // Held across the spawn so the task cannot deregister before it is registered.
        let mut running = self.running.lock().await;
        let handle = tokio::spawn(async move {
            let response = Self::run_payload(payload).await;
            if let Err(e) = wait_notify.notify(&correlation_id, response).await {
                warn!(task_id = %own_id, correlation_id = %correlation_id, error = %e, "Failed to deliver task completion");
            }
            tracked.lock().await.remove(&own_id);
        });
        running.insert(task_id.clone(), handle.abort_handle());
        drop(running);

        info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    async fn abort_task(&self, task_id: &str) -> Result<()> {
        match self.running.lock().await.remove(task_id) {
            Some(handle) => {
                handle.abort();
                info!(task_id, "Task aborted");
                Ok(())
            }
            None => Err(OrchestratorError::NotFound(format!("task {task_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{create_memory_pool, run_migrations, ExecutionStore};

    async fn dispatcher() -> InProcessTaskDispatcher {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        InProcessTaskDispatcher::new(WaitNotifyService::new(ExecutionStore::new(pool)))
    }

    #[tokio::test]
    async fn test_submit_task_times_out() {
        let dispatcher = dispatcher().await;
        let ok = dispatcher
            .submit_task(json!({"sleep_ms": 1}), Duration::from_secs(5))
            .await;
        assert!(ok.is_ok());

        let err = dispatcher
            .submit_task(json!({"sleep_ms": 5_000}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskDispatch(_)));
    }

    #[tokio::test]
    async fn test_abort_running_task() {
        let dispatcher = dispatcher().await;
        let task_id = dispatcher
            .submit_task_async(json!({"sleep_ms": 60_000}), "cid-1")
            .await
            .unwrap();
        assert_eq!(dispatcher.running_count().await, 1);

        dispatcher.abort_task(&task_id).await.unwrap();
        assert!(dispatcher.abort_task(&task_id).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_task_is_forgotten() {
        let dispatcher = dispatcher().await;
        for n in 0..5 {
            dispatcher
                .submit_task_async(json!({"sleep_ms": 1}), &format!("cid-{n}"))
                .await
                .unwrap();
        }
        for _ in 0..200 {
            if dispatcher.running_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_payload_failure_shape() {
        let response =
            InProcessTaskDispatcher::run_payload(json!({"fail": {"code": "E1", "message": "x"}}))
                .await;
        assert_eq!(response["status"], "failed");
        assert_eq!(response["failure"]["code"], "E1");
    }
}
