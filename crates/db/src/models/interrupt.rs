use conductor_core::{Interrupt, InterruptState, InterruptType};

use super::{datetime_to_millis, millis_to_datetime, parse_opt_uuid, parse_uuid};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InterruptRow {
    pub id: String,
    pub interrupt_type: String,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub state: String,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

impl InterruptRow {
    pub fn into_domain(self) -> Result<Interrupt, DbError> {
        Ok(Interrupt {
            id: parse_uuid(&self.id, "interrupts.id")?,
            interrupt_type: InterruptType::parse(&self.interrupt_type).ok_or_else(|| {
                DbError::corrupt(format!("interrupt type `{}`", self.interrupt_type))
            })?,
            plan_execution_id: parse_uuid(&self.plan_execution_id, "interrupts.plan_execution_id")?,
            node_execution_id: parse_opt_uuid(
                self.node_execution_id.as_deref(),
                "interrupts.node_execution_id",
            )?,
            state: InterruptState::parse(&self.state)
                .ok_or_else(|| DbError::corrupt(format!("interrupt state `{}`", self.state)))?,
            created_at: millis_to_datetime(self.created_at),
            processed_at: self.processed_at.map(millis_to_datetime),
        })
    }
}

impl From<&Interrupt> for InterruptRow {
    fn from(interrupt: &Interrupt) -> Self {
        Self {
            id: interrupt.id.to_string(),
            interrupt_type: interrupt.interrupt_type.as_str().to_string(),
            plan_execution_id: interrupt.plan_execution_id.to_string(),
            node_execution_id: interrupt.node_execution_id.map(|id| id.to_string()),
            state: interrupt.state.as_str().to_string(),
            created_at: datetime_to_millis(interrupt.created_at),
            processed_at: interrupt.processed_at.map(datetime_to_millis),
        }
    }
}
