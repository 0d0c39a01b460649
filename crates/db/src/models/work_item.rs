use conductor_core::{WorkItem, WorkKind};

use super::{datetime_to_millis, millis_to_datetime, parse_opt_uuid, parse_uuid};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkItemRow {
    pub id: String,
    pub kind: String,
    pub node_execution_id: Option<String>,
    pub payload: String,
    pub ready_at: i64,
    pub attempts: i64,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<i64>,
    pub created_at: i64,
}

impl WorkItemRow {
    pub fn into_domain(self) -> Result<WorkItem, DbError> {
        Ok(WorkItem {
            id: parse_uuid(&self.id, "work_items.id")?,
            kind: WorkKind::parse(&self.kind)
                .ok_or_else(|| DbError::corrupt(format!("work kind `{}`", self.kind)))?,
            node_execution_id: parse_opt_uuid(
                self.node_execution_id.as_deref(),
                "work_items.node_execution_id",
            )?,
            payload: serde_json::from_str(&self.payload)?,
            ready_at: millis_to_datetime(self.ready_at),
            attempts: self.attempts,
            claimed_by: self.claimed_by,
            claimed_until: self.claimed_until.map(millis_to_datetime),
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

impl From<&WorkItem> for WorkItemRow {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id.to_string(),
            kind: item.kind.as_str().to_string(),
            node_execution_id: item.node_execution_id.map(|id| id.to_string()),
            payload: item.payload.to_string(),
            ready_at: datetime_to_millis(item.ready_at),
            attempts: item.attempts,
            claimed_by: item.claimed_by.clone(),
            claimed_until: item.claimed_until.map(datetime_to_millis),
            created_at: datetime_to_millis(item.created_at),
        }
    }
}
