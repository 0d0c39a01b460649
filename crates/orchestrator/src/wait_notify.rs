//! Durable suspension and resumption.
//!
//! Nothing here blocks: a wait is a row keyed by correlation id, a delay is a
//! work item that becomes ready later, and a notify is one conditional update
//! that also queues the node's resumption.

use chrono::Utc;
use conductor_core::{
    new_correlation_id, to_chrono, NodeExecution, WaitInstance, WaitPurpose, WorkItem,
};
use db::{ExecutionStore, UnitOfWork};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// This notify won; the node's resumption has been queued.
    Resumed { node_execution_id: Uuid },
    /// Unknown or already consumed correlation id.
    Ignored,
}

#[derive(Clone)]
pub struct WaitNotifyService {
    store: ExecutionStore,
}

impl WaitNotifyService {
    pub fn new(store: ExecutionStore) -> Self {
        Self { store }
    }

    /// Registers a wait for `node` and records the correlation id as its `notify_id`.
    /// Returns the node as stored.
    pub async fn wait(
        &self,
        correlation_id: &str,
        node: &NodeExecution,
        purpose: WaitPurpose,
        context: HashMap<String, String>,
    ) -> Result<NodeExecution> {
        let wait = WaitInstance::new(correlation_id, node.id, node.plan_execution_id, purpose)
            .with_context(context);
        let mut parked = node.clone();
        parked.notify_id = Some(correlation_id.to_string());

        let mut uow = UnitOfWork::new();
        uow.register_wait(wait).update_node(&parked, node.status);
        self.store.commit(uow).await?;

        debug!(
            node_execution_id = %node.id,
            correlation_id,
            purpose = purpose.as_str(),
            "Wait registered"
        );
        Ok(self.store.nodes().get(node.id).await?)
    }

    /// Schedules a notify for a fresh correlation id after `duration`.
    pub async fn delay(&self, duration: Duration, context: HashMap<String, String>) -> Result<String> {
        let correlation_id = new_correlation_id();
        self.delay_for(&correlation_id, duration, context).await?;
        Ok(correlation_id)
    }

    /// Schedules a notify for `correlation_id` after `duration`.
    pub async fn delay_for(
        &self,
        correlation_id: &str,
        duration: Duration,
        context: HashMap<String, String>,
    ) -> Result<()> {
        let item = delay_item(correlation_id, duration, context);
        debug!(correlation_id, ready_at = %item.ready_at, "Delay scheduled");
        self.store.work().enqueue(&item).await?;
        Ok(())
    }

    /// Delivers `response` to whoever waits on `correlation_id`. Exactly one
    /// notify per correlation id resumes a node; the rest are ignored.
    pub async fn notify(&self, correlation_id: &str, response: Value) -> Result<NotifyOutcome> {
        match self.store.waits().consume(correlation_id, &response).await? {
            Some(wait) => {
                info!(
                    correlation_id,
                    node_execution_id = %wait.node_execution_id,
                    purpose = wait.purpose.as_str(),
                    "Wait consumed, resumption queued"
                );
                Ok(NotifyOutcome::Resumed {
                    node_execution_id: wait.node_execution_id,
                })
            }
            None => {
                debug!(correlation_id, "Notify ignored: no pending wait");
                Ok(NotifyOutcome::Ignored)
            }
        }
    }

    /// Drops every unconsumed wait of a node.
    pub async fn cancel_waits(&self, node_execution_id: Uuid) -> Result<u64> {
        let cancelled = self.store.waits().cancel_for_node(node_execution_id).await?;
        if cancelled > 0 {
            debug!(node_execution_id = %node_execution_id, cancelled, "Waits cancelled");
        }
        Ok(cancelled)
    }
}

/// Builds the durable timer for a delay; also used inside engine units of work.
pub(crate) fn delay_item(
    correlation_id: &str,
    duration: Duration,
    context: HashMap<String, String>,
) -> WorkItem {
    let mut item = WorkItem::delay_elapsed(correlation_id, Utc::now() + to_chrono(duration));
    if !context.is_empty() {
        item.payload["context"] = serde_json::json!(context);
    }
    item
}

/// Payload delivered by an elapsed delay.
pub(crate) fn delay_response(item: &WorkItem) -> Value {
    serde_json::json!({
        "delay_elapsed": true,
        "context": item.payload.get("context").cloned().unwrap_or(Value::Null),
    })
}
