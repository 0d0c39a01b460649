mod interrupt;
mod node_execution;
mod plan_execution;
mod wait_instance;
mod work_item;

pub use interrupt::InterruptRow;
pub use node_execution::NodeExecutionRow;
pub(crate) use node_execution::NODE_COLUMNS;
pub use plan_execution::PlanExecutionRow;
pub use wait_instance::WaitInstanceRow;
pub use work_item::WorkItemRow;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::DbError;

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(value).map_err(|_| DbError::corrupt(format!("{column}: `{value}` is not a uuid")))
}

pub(crate) fn parse_opt_uuid(value: Option<&str>, column: &str) -> Result<Option<Uuid>, DbError> {
    value.map(|v| parse_uuid(v, column)).transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DbError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn to_opt_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, DbError> {
    value.map(to_json).transpose()
}

pub(crate) fn from_opt_json<T: serde::de::DeserializeOwned>(
    value: Option<&str>,
) -> Result<Option<T>, DbError> {
    value
        .map(|v| serde_json::from_str(v).map_err(DbError::from))
        .transpose()
}
