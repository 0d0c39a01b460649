use conductor_core::{WaitInstance, WaitPurpose};

use super::{datetime_to_millis, from_opt_json, millis_to_datetime, parse_uuid, to_json, to_opt_json};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WaitInstanceRow {
    pub correlation_id: String,
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub purpose: String,
    pub context: String,
    pub response: Option<String>,
    pub created_at: i64,
    pub consumed_at: Option<i64>,
}

impl WaitInstanceRow {
    pub fn into_domain(self) -> Result<WaitInstance, DbError> {
        Ok(WaitInstance {
            node_execution_id: parse_uuid(&self.node_execution_id, "wait_instances.node_execution_id")?,
            plan_execution_id: parse_uuid(&self.plan_execution_id, "wait_instances.plan_execution_id")?,
            purpose: WaitPurpose::parse(&self.purpose)
                .ok_or_else(|| DbError::corrupt(format!("wait purpose `{}`", self.purpose)))?,
            context: serde_json::from_str(&self.context)?,
            response: from_opt_json(self.response.as_deref())?,
            correlation_id: self.correlation_id,
            created_at: millis_to_datetime(self.created_at),
            consumed_at: self.consumed_at.map(millis_to_datetime),
        })
    }
}

impl TryFrom<&WaitInstance> for WaitInstanceRow {
    type Error = DbError;

    fn try_from(wait: &WaitInstance) -> Result<Self, Self::Error> {
        Ok(Self {
            correlation_id: wait.correlation_id.clone(),
            node_execution_id: wait.node_execution_id.to_string(),
            plan_execution_id: wait.plan_execution_id.to_string(),
            purpose: wait.purpose.as_str().to_string(),
            context: to_json(&wait.context)?,
            response: to_opt_json(wait.response.as_ref())?,
            created_at: datetime_to_millis(wait.created_at),
            consumed_at: wait.consumed_at.map(datetime_to_millis),
        })
    }
}
