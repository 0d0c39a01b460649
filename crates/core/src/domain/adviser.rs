//! Adviser configuration carried by plan nodes.
//!
//! Each plan node lists [`AdviserObtainment`]s in the order they are tried.
//! The decision logic lives with the engine; these types only describe the
//! declared policy and the pure arithmetic that goes with it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::failure::FailureInfo;
use super::status::Status;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserObtainment {
    OnSuccess(OnSuccessAdviser),
    OnFail(OnFailAdviser),
    Retry(RetryAdviser),
    IgnoreFailure(IgnoreFailureAdviser),
    MarkSuccess(MarkSuccessAdviser),
    EndPlan(EndPlanAdviser),
}

impl AdviserObtainment {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OnSuccess(_) => "on_success",
            Self::OnFail(_) => "on_fail",
            Self::Retry(_) => "retry",
            Self::IgnoreFailure(_) => "ignore_failure",
            Self::MarkSuccess(_) => "mark_success",
            Self::EndPlan(_) => "end_plan",
        }
    }
}

/// Moves on after a success, optionally overriding the plan's next edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnSuccessAdviser {
    #[serde(default)]
    pub next_node_id: Option<String>,
}

/// Routes a failure along the node's on-failure edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnFailAdviser {
    #[serde(default)]
    pub failure_codes: Vec<String>,
}

/// What a retry adviser does once its retries are used up.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    #[default]
    MarkFailed,
    Ignore,
    MarkSuccess,
    EndPlan,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    #[default]
    Immediate,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        max_delay_ms: u64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryAdviser {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Explicit per-retry waits; the last entry repeats. Takes precedence over `backoff`.
    #[serde(default)]
    pub wait_intervals_secs: Vec<u64>,
    #[serde(default)]
    pub failure_codes: Vec<String>,
    #[serde(default)]
    pub after_retries: RepairAction,
}

impl RetryAdviser {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffPolicy::Immediate,
            wait_intervals_secs: Vec::new(),
            failure_codes: Vec::new(),
            after_retries: RepairAction::MarkFailed,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_wait_intervals(mut self, intervals_secs: Vec<u64>) -> Self {
        self.wait_intervals_secs = intervals_secs;
        self
    }

    pub fn with_failure_codes(mut self, codes: Vec<String>) -> Self {
        self.failure_codes = codes;
        self
    }

    pub fn with_after_retries(mut self, action: RepairAction) -> Self {
        self.after_retries = action;
        self
    }

    /// Wait before retry number `retry` (1-based). Pure function of the config.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        if let Some(last) = self.wait_intervals_secs.last() {
            let idx = (retry - 1) as usize;
            let secs = self.wait_intervals_secs.get(idx).unwrap_or(last);
            return Duration::from_secs(*secs);
        }
        match &self.backoff {
            BackoffPolicy::Immediate => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let factor = multiplier.max(1.0).powi((retry - 1) as i32);
                let delay = (*initial_delay_ms as f64 * factor).min(*max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoreFailureAdviser {
    #[serde(default)]
    pub failure_codes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkSuccessAdviser {
    #[serde(default)]
    pub failure_codes: Vec<String>,
}

/// Ends the whole plan when the node finishes with one of `on_statuses`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndPlanAdviser {
    #[serde(default)]
    pub on_statuses: Vec<Status>,
}

/// True when `failure` carries one of `codes`; an empty list matches any failure.
pub fn matches_failure_codes(codes: &[String], failure: Option<&FailureInfo>) -> bool {
    if codes.is_empty() {
        return true;
    }
    failure.is_some_and(|info| codes.iter().any(|code| info.has_code(code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_immediate_and_fixed() {
        let retry = RetryAdviser::new(3);
        assert_eq!(retry.delay_for_retry(1), Duration::ZERO);

        let retry = RetryAdviser::new(3).with_backoff(BackoffPolicy::Fixed { delay_ms: 250 });
        assert_eq!(retry.delay_for_retry(2), Duration::from_millis(250));
    }

    #[test]
    fn test_delay_exponential_is_capped() {
        let retry = RetryAdviser::new(5).with_backoff(BackoffPolicy::Exponential {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 500,
        });
        assert_eq!(retry.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_retry(4), Duration::from_millis(500));
    }

    #[test]
    fn test_wait_intervals_repeat_last() {
        let retry = RetryAdviser::new(4).with_wait_intervals(vec![1, 5]);
        assert_eq!(retry.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_retry(2), Duration::from_secs(5));
        assert_eq!(retry.delay_for_retry(3), Duration::from_secs(5));
    }

    #[test]
    fn test_failure_code_matching() {
        let info = FailureInfo::new("E1", "boom");
        assert!(matches_failure_codes(&[], Some(&info)));
        assert!(matches_failure_codes(&[], None));
        assert!(matches_failure_codes(&["E1".to_string()], Some(&info)));
        assert!(!matches_failure_codes(&["E2".to_string()], Some(&info)));
        assert!(!matches_failure_codes(&["E1".to_string()], None));
    }

    #[test]
    fn test_obtainment_deserialization() {
        let json = r#"[
            {"type": "retry", "max_retries": 2, "backoff": {"kind": "fixed", "delay_ms": 10}},
            {"type": "on_fail"},
            {"type": "end_plan", "on_statuses": ["failed"]}
        ]"#;
        let advisers: Vec<AdviserObtainment> = serde_json::from_str(json).unwrap();
        assert_eq!(advisers.len(), 3);
        match &advisers[0] {
            AdviserObtainment::Retry(retry) => {
                assert_eq!(retry.max_retries, 2);
                assert_eq!(retry.after_retries, RepairAction::MarkFailed);
            }
            other => panic!("unexpected adviser {other:?}"),
        }
        assert_eq!(advisers[1].kind(), "on_fail");
    }
}
