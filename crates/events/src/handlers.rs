use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::registry::EventHandler;
use crate::types::{Event, EventEnvelope};

/// Writes lifecycle events to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        match &envelope.event {
            Event::PlanStart {
                plan_execution_id,
                plan_name,
            } => info!(%plan_execution_id, plan = %plan_name, "Plan started"),
            Event::PlanEnd {
                plan_execution_id,
                status,
            } => info!(%plan_execution_id, %status, "Plan ended"),
            Event::NodeEnd { node } => info!(
                node_execution_id = %node.node_execution_id,
                identifier = %node.identifier,
                status = %node.status,
                "Node ended"
            ),
            Event::InterruptApplied {
                plan_execution_id,
                node_execution_id,
                interrupt_type,
                ..
            } => info!(
                %plan_execution_id,
                node_execution_id = ?node_execution_id,
                %interrupt_type,
                "Interrupt applied"
            ),
            other => debug!(
                sequence = envelope.sequence,
                event_type = %other.event_type(),
                node_execution_id = ?other.node_execution_id(),
                "Engine event"
            ),
        }
        Ok(())
    }
}
