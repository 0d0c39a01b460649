use conductor_core::{FacilitationMode, NodeExecution, Status};

use super::{
    datetime_to_millis, from_opt_json, millis_to_datetime, parse_opt_uuid, parse_uuid, to_json,
    to_opt_json,
};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeExecutionRow {
    pub id: String,
    pub plan_execution_id: String,
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: String,
    pub facilitation: String,
    pub ambiance: String,
    pub resolved_parameters: Option<String>,
    pub status: String,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub expiry_at: Option<i64>,
    pub notify_id: Option<String>,
    pub parent_id: Option<String>,
    pub next_id: Option<String>,
    pub previous_id: Option<String>,
    pub attempt_id: String,
    pub retry_ids: String,
    pub interrupt_history: String,
    pub executable_response: Option<String>,
    pub pending_children: i64,
    pub failure_info: Option<String>,
    pub outputs: Option<String>,
    pub adviser_expired: bool,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

pub(crate) const NODE_COLUMNS: &str = "id, plan_execution_id, plan_node_id, identifier, step_type, \
    facilitation, ambiance, resolved_parameters, status, started_at, ended_at, expiry_at, notify_id, \
    parent_id, next_id, previous_id, attempt_id, retry_ids, interrupt_history, executable_response, \
    pending_children, failure_info, outputs, adviser_expired, version, created_at, updated_at";

impl NodeExecutionRow {
    pub fn into_domain(self) -> Result<NodeExecution, DbError> {
        Ok(NodeExecution {
            id: parse_uuid(&self.id, "node_executions.id")?,
            plan_execution_id: parse_uuid(&self.plan_execution_id, "node_executions.plan_execution_id")?,
            plan_node_id: self.plan_node_id,
            identifier: self.identifier,
            step_type: self.step_type,
            facilitation: FacilitationMode::parse(&self.facilitation)
                .ok_or_else(|| DbError::corrupt(format!("facilitation `{}`", self.facilitation)))?,
            ambiance: serde_json::from_str(&self.ambiance)?,
            resolved_parameters: from_opt_json(self.resolved_parameters.as_deref())?,
            status: Status::parse(&self.status)
                .ok_or_else(|| DbError::corrupt(format!("node status `{}`", self.status)))?,
            started_at: self.started_at.map(millis_to_datetime),
            ended_at: self.ended_at.map(millis_to_datetime),
            expiry_at: self.expiry_at.map(millis_to_datetime),
            notify_id: self.notify_id,
            parent_id: parse_opt_uuid(self.parent_id.as_deref(), "node_executions.parent_id")?,
            next_id: parse_opt_uuid(self.next_id.as_deref(), "node_executions.next_id")?,
            previous_id: parse_opt_uuid(self.previous_id.as_deref(), "node_executions.previous_id")?,
            attempt_id: parse_uuid(&self.attempt_id, "node_executions.attempt_id")?,
            retry_ids: serde_json::from_str(&self.retry_ids)?,
            interrupt_history: serde_json::from_str(&self.interrupt_history)?,
            executable_response: from_opt_json(self.executable_response.as_deref())?,
            pending_children: self.pending_children,
            failure_info: from_opt_json(self.failure_info.as_deref())?,
            outputs: from_opt_json(self.outputs.as_deref())?,
            adviser_expired: self.adviser_expired,
            version: self.version,
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
        })
    }
}

impl TryFrom<&NodeExecution> for NodeExecutionRow {
    type Error = DbError;

    fn try_from(node: &NodeExecution) -> Result<Self, Self::Error> {
        Ok(Self {
            id: node.id.to_string(),
            plan_execution_id: node.plan_execution_id.to_string(),
            plan_node_id: node.plan_node_id.clone(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            facilitation: node.facilitation.as_str().to_string(),
            ambiance: to_json(&node.ambiance)?,
            resolved_parameters: to_opt_json(node.resolved_parameters.as_ref())?,
            status: node.status.as_str().to_string(),
            started_at: node.started_at.map(datetime_to_millis),
            ended_at: node.ended_at.map(datetime_to_millis),
            expiry_at: node.expiry_at.map(datetime_to_millis),
            notify_id: node.notify_id.clone(),
            parent_id: node.parent_id.map(|id| id.to_string()),
            next_id: node.next_id.map(|id| id.to_string()),
            previous_id: node.previous_id.map(|id| id.to_string()),
            attempt_id: node.attempt_id.to_string(),
            retry_ids: to_json(&node.retry_ids)?,
            interrupt_history: to_json(&node.interrupt_history)?,
            executable_response: to_opt_json(node.executable_response.as_ref())?,
            pending_children: node.pending_children,
            failure_info: to_opt_json(node.failure_info.as_ref())?,
            outputs: to_opt_json(node.outputs.as_ref())?,
            adviser_expired: node.adviser_expired,
            version: node.version,
            created_at: datetime_to_millis(node.created_at),
            updated_at: datetime_to_millis(node.updated_at),
        })
    }
}
