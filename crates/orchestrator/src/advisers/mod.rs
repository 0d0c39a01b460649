//! Post-step control flow.
//!
//! After every step outcome the engine builds an [`AdvisingEvent`] and asks the
//! node's advisers, in declaration order, what happens next. The first adviser
//! whose `can_advise` accepts the event decides; when none does the engine
//! falls back to the plan's edges.

mod builtin;

use conductor_core::{AdviserObtainment, FailureInfo, PlanStatus, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Everything an adviser may look at. Advisers read nothing else.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisingEvent {
    /// Proposed outcome of the step: `Succeeded` or `Failed`.
    pub status: Status,
    pub failure: Option<FailureInfo>,
    pub retry_count: u32,
    pub is_previous_adviser_expired: bool,
    pub next_node_id: Option<String>,
    pub on_failure_node_id: Option<String>,
}

impl AdvisingEvent {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            failure: None,
            retry_count: 0,
            is_previous_adviser_expired: false,
            next_node_id: None,
            on_failure_node_id: None,
        }
    }

    pub fn with_failure(mut self, failure: Option<FailureInfo>) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_expired(mut self, expired: bool) -> Self {
        self.is_previous_adviser_expired = expired;
        self
    }

    pub fn with_edges(mut self, next_node_id: Option<String>, on_failure_node_id: Option<String>) -> Self {
        self.next_node_id = next_node_id;
        self.on_failure_node_id = on_failure_node_id;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == Status::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserResponse {
    /// Finalise with `status` and continue at `next_node_id`, or end the chain.
    NextStep {
        next_node_id: Option<String>,
        status: Status,
    },
    /// Run the step again after `delay`; `attempt` is the 1-based retry number.
    Retry { delay: Duration, attempt: u32 },
    IgnoreFailure { next_node_id: Option<String> },
    MarkSuccess { next_node_id: Option<String> },
    MarkFailed,
    EndPlan { status: PlanStatus },
}

impl AdviserResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NextStep { .. } => "next_step",
            Self::Retry { .. } => "retry",
            Self::IgnoreFailure { .. } => "ignore_failure",
            Self::MarkSuccess { .. } => "mark_success",
            Self::MarkFailed => "mark_failed",
            Self::EndPlan { .. } => "end_plan",
        }
    }
}

impl fmt::Display for AdviserResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NextStep {
                next_node_id: Some(next),
                status,
            } => write!(f, "next_step({status} -> {next})"),
            Self::NextStep { status, .. } => write!(f, "next_step({status})"),
            Self::Retry { delay, attempt } => {
                write!(f, "retry(#{attempt} after {}ms)", delay.as_millis())
            }
            Self::EndPlan { status } => write!(f, "end_plan({status})"),
            other => f.write_str(other.kind()),
        }
    }
}

pub trait Adviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool;
    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse;
}

/// Maps a configured obtainment to its decision logic.
pub fn adviser_for(obtainment: &AdviserObtainment) -> &dyn Adviser {
    match obtainment {
        AdviserObtainment::OnSuccess(a) => a,
        AdviserObtainment::OnFail(a) => a,
        AdviserObtainment::Retry(a) => a,
        AdviserObtainment::IgnoreFailure(a) => a,
        AdviserObtainment::MarkSuccess(a) => a,
        AdviserObtainment::EndPlan(a) => a,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdviserEngine;

impl AdviserEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn advise(&self, advisers: &[AdviserObtainment], event: &AdvisingEvent) -> AdviserResponse {
        let response = advisers
            .iter()
            .find(|obtainment| adviser_for(obtainment).can_advise(event))
            .map(|obtainment| {
                debug!(adviser = obtainment.kind(), "Adviser selected");
                adviser_for(obtainment).advise(event)
            })
            .unwrap_or_else(|| Self::pass_through(event));

        match response {
            AdviserResponse::Retry { .. } if event.is_previous_adviser_expired => {
                debug!(retry_count = event.retry_count, "Retry budget spent, failing node");
                AdviserResponse::MarkFailed
            }
            other => other,
        }
    }

    /// Default when no adviser applies: follow the next edge on success, fail closed otherwise.
    fn pass_through(event: &AdvisingEvent) -> AdviserResponse {
        match event.status {
            Status::Succeeded | Status::IgnoreFailed => AdviserResponse::NextStep {
                next_node_id: event.next_node_id.clone(),
                status: event.status,
            },
            _ => AdviserResponse::MarkFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{
        EndPlanAdviser, OnFailAdviser, OnSuccessAdviser, RepairAction, RetryAdviser,
    };

    fn failed(code: &str) -> AdvisingEvent {
        AdvisingEvent::new(Status::Failed)
            .with_failure(Some(FailureInfo::new(code, "boom")))
            .with_edges(Some("next".into()), Some("cleanup".into()))
    }

    #[test]
    fn test_pass_through_defaults() {
        let engine = AdviserEngine::new();
        let success = AdvisingEvent::new(Status::Succeeded).with_edges(Some("b".into()), None);
        assert_eq!(
            engine.advise(&[], &success),
            AdviserResponse::NextStep {
                next_node_id: Some("b".into()),
                status: Status::Succeeded
            }
        );
        assert_eq!(engine.advise(&[], &failed("E1")), AdviserResponse::MarkFailed);
    }

    #[test]
    fn test_first_applicable_adviser_wins() {
        let engine = AdviserEngine::new();
        let advisers = vec![
            AdviserObtainment::OnSuccess(OnSuccessAdviser::default()),
            AdviserObtainment::OnFail(OnFailAdviser {
                failure_codes: vec!["E2".into()],
            }),
            AdviserObtainment::Retry(RetryAdviser::new(2)),
        ];

        // OnSuccess does not apply to failures, OnFail filters on E2.
        assert_eq!(
            engine.advise(&advisers, &failed("E1")),
            AdviserResponse::Retry {
                delay: Duration::ZERO,
                attempt: 1
            }
        );
        assert_eq!(
            engine.advise(&advisers, &failed("E2")),
            AdviserResponse::NextStep {
                next_node_id: Some("cleanup".into()),
                status: Status::Failed
            }
        );
    }

    #[test]
    fn test_expired_flag_downgrades_retry() {
        let engine = AdviserEngine::new();
        let advisers = vec![AdviserObtainment::Retry(RetryAdviser::new(100))];
        let event = failed("E1").with_expired(true);
        assert_eq!(engine.advise(&advisers, &event), AdviserResponse::MarkFailed);
    }

    #[test]
    fn test_advice_is_deterministic() {
        let engine = AdviserEngine::new();
        let advisers = vec![
            AdviserObtainment::Retry(
                RetryAdviser::new(3).with_after_retries(RepairAction::EndPlan),
            ),
            AdviserObtainment::EndPlan(EndPlanAdviser {
                on_statuses: vec![Status::Failed],
            }),
        ];
        for retry_count in 0..5 {
            let event = failed("E1").with_retry_count(retry_count);
            let first = engine.advise(&advisers, &event);
            for _ in 0..10 {
                assert_eq!(engine.advise(&advisers, &event), first);
            }
        }
    }

    #[test]
    fn test_display() {
        let response = AdviserResponse::Retry {
            delay: Duration::from_millis(250),
            attempt: 2,
        };
        assert_eq!(response.to_string(), "retry(#2 after 250ms)");
        assert_eq!(AdviserResponse::MarkFailed.to_string(), "mark_failed");
    }
}
