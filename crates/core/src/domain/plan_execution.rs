use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::ambiance::Ambiance;
use super::plan::Plan;
use super::status::PlanStatus;

/// One run of a compiled plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan: Plan,
    pub status: PlanStatus,
    pub setup_abstractions: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// When the expiry sweep next looks at this execution. Only ever moves forward.
    pub next_iteration: DateTime<Utc>,
    /// Retention deadline; the purge deletes the record after this instant.
    pub valid_until: DateTime<Utc>,
    pub version: i64,
}

impl PlanExecution {
    pub fn new(
        plan: Plan,
        setup_abstractions: HashMap<String, String>,
        retention: Duration,
        iteration_interval: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plan,
            status: PlanStatus::Running,
            setup_abstractions,
            started_at: now,
            ended_at: None,
            next_iteration: now + to_chrono(iteration_interval),
            valid_until: now + to_chrono(retention),
            version: 0,
        }
    }

    /// Top-level scope: no levels, just the execution id and abstractions.
    pub fn root_ambiance(&self) -> Ambiance {
        Ambiance::new(self.id, self.setup_abstractions.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Converts a std duration, saturating at one century.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
