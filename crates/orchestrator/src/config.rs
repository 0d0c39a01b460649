use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the engine, its workers and the expiry sweep.
///
/// Every field has a default so a partial `[engine]` table deserializes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    /// Idle sleep between empty claims.
    pub poll_interval_ms: u64,
    /// Lease on a claimed work item; a crashed worker's items come back after it.
    pub claim_ttl_secs: u64,
    pub max_conflict_retries: u32,
    pub requeue_backoff_ms: u64,
    /// Retries after which advisers see `is_previous_adviser_expired`.
    pub max_retry_attempts: u32,
    pub default_node_timeout_secs: u64,
    pub plan_retention_secs: u64,
    pub iteration_interval_secs: u64,
    /// How long work for a paused plan or suspended node is pushed back.
    pub pause_poll_ms: u64,
    pub event_workers: usize,
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 100,
            claim_ttl_secs: 60,
            max_conflict_retries: 5,
            requeue_backoff_ms: 250,
            max_retry_attempts: 10,
            default_node_timeout_secs: 24 * 60 * 60,
            plan_retention_secs: 30 * 24 * 60 * 60,
            iteration_interval_secs: 30,
            pause_poll_ms: 500,
            event_workers: 2,
            event_queue_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl_secs = ttl.as_secs().max(1);
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_requeue_backoff(mut self, backoff: Duration) -> Self {
        self.requeue_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_default_node_timeout(mut self, timeout: Duration) -> Self {
        self.default_node_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_plan_retention(mut self, retention: Duration) -> Self {
        self.plan_retention_secs = retention.as_secs();
        self
    }

    pub fn with_iteration_interval(mut self, interval: Duration) -> Self {
        self.iteration_interval_secs = interval.as_secs();
        self
    }

    pub fn with_pause_poll(mut self, poll: Duration) -> Self {
        self.pause_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn with_event_workers(mut self, workers: usize) -> Self {
        self.event_workers = workers.max(1);
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }

    pub fn default_node_timeout(&self) -> Duration {
        Duration::from_secs(self.default_node_timeout_secs)
    }

    pub fn plan_retention(&self) -> Duration {
        Duration::from_secs(self.plan_retention_secs)
    }

    pub fn iteration_interval(&self) -> Duration {
        Duration::from_secs(self.iteration_interval_secs)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"workers": 8, "max_retry_attempts": 2}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_retry_attempts, 2);
        assert_eq!(config.claim_ttl_secs, EngineConfig::default().claim_ttl_secs);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_workers(0)
            .with_poll_interval(Duration::from_millis(5))
            .with_pause_poll(Duration::from_millis(20));
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
        assert_eq!(config.pause_poll(), Duration::from_millis(20));
    }
}
