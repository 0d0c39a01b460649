use conductor_core::{
    matches_failure_codes, EndPlanAdviser, IgnoreFailureAdviser, MarkSuccessAdviser,
    OnFailAdviser, OnSuccessAdviser, PlanStatus, RepairAction, RetryAdviser, Status,
};

use super::{Adviser, AdviserResponse, AdvisingEvent};

fn failure_matches(codes: &[String], event: &AdvisingEvent) -> bool {
    event.is_failure() && matches_failure_codes(codes, event.failure.as_ref())
}

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.status == Status::Succeeded
    }

    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse {
        AdviserResponse::NextStep {
            next_node_id: self
                .next_node_id
                .clone()
                .or_else(|| event.next_node_id.clone()),
            status: Status::Succeeded,
        }
    }
}

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.on_failure_node_id.is_some() && failure_matches(&self.failure_codes, event)
    }

    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse {
        AdviserResponse::NextStep {
            next_node_id: event.on_failure_node_id.clone(),
            status: Status::Failed,
        }
    }
}

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        failure_matches(&self.failure_codes, event)
    }

    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse {
        if !event.is_previous_adviser_expired && event.retry_count < self.max_retries {
            let attempt = event.retry_count + 1;
            return AdviserResponse::Retry {
                delay: self.delay_for_retry(attempt),
                attempt,
            };
        }
        match self.after_retries {
            RepairAction::MarkFailed => AdviserResponse::MarkFailed,
            RepairAction::Ignore => AdviserResponse::IgnoreFailure {
                next_node_id: event.next_node_id.clone(),
            },
            RepairAction::MarkSuccess => AdviserResponse::MarkSuccess {
                next_node_id: event.next_node_id.clone(),
            },
            RepairAction::EndPlan => AdviserResponse::EndPlan {
                status: PlanStatus::Failed,
            },
        }
    }
}

impl Adviser for IgnoreFailureAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        failure_matches(&self.failure_codes, event)
    }

    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse {
        AdviserResponse::IgnoreFailure {
            next_node_id: event.next_node_id.clone(),
        }
    }
}

impl Adviser for MarkSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        failure_matches(&self.failure_codes, event)
    }

    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse {
        AdviserResponse::MarkSuccess {
            next_node_id: event.next_node_id.clone(),
        }
    }
}

impl Adviser for EndPlanAdviser {
    /// An empty status list means "on failure".
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        if self.on_statuses.is_empty() {
            return event.is_failure();
        }
        self.on_statuses.contains(&event.status)
    }

    fn advise(&self, event: &AdvisingEvent) -> AdviserResponse {
        AdviserResponse::EndPlan {
            status: PlanStatus::from_node_status(event.status),
        }
    }
}
