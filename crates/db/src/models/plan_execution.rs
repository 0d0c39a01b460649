use conductor_core::{PlanExecution, PlanStatus};

use super::{datetime_to_millis, millis_to_datetime, parse_uuid, to_json};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanExecutionRow {
    pub id: String,
    pub plan: String,
    pub status: String,
    pub setup_abstractions: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub next_iteration: i64,
    pub valid_until: i64,
    pub version: i64,
}

impl PlanExecutionRow {
    pub fn into_domain(self) -> Result<PlanExecution, DbError> {
        Ok(PlanExecution {
            id: parse_uuid(&self.id, "plan_executions.id")?,
            plan: serde_json::from_str(&self.plan)?,
            status: PlanStatus::parse(&self.status)
                .ok_or_else(|| DbError::corrupt(format!("plan status `{}`", self.status)))?,
            setup_abstractions: serde_json::from_str(&self.setup_abstractions)?,
            started_at: millis_to_datetime(self.started_at),
            ended_at: self.ended_at.map(millis_to_datetime),
            next_iteration: millis_to_datetime(self.next_iteration),
            valid_until: millis_to_datetime(self.valid_until),
            version: self.version,
        })
    }
}

impl TryFrom<&PlanExecution> for PlanExecutionRow {
    type Error = DbError;

    fn try_from(execution: &PlanExecution) -> Result<Self, Self::Error> {
        Ok(Self {
            id: execution.id.to_string(),
            plan: to_json(&execution.plan)?,
            status: execution.status.as_str().to_string(),
            setup_abstractions: to_json(&execution.setup_abstractions)?,
            started_at: datetime_to_millis(execution.started_at),
            ended_at: execution.ended_at.map(datetime_to_millis),
            next_iteration: datetime_to_millis(execution.next_iteration),
            valid_until: datetime_to_millis(execution.valid_until),
            version: execution.version,
        })
    }
}
