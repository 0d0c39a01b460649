use conductor_core::{PlanStatus, Status};

use crate::error::{OrchestratorError, Result};

pub struct NodeStateMachine;

impl NodeStateMachine {
    pub fn validate_transition(from: &Status, to: &Status) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &Status) -> Vec<Status> {
        match from {
            // Failed straight from queued only when the engine cannot start the node.
            Status::Queued => vec![
                Status::Running,
                Status::Failed,
                Status::Aborted,
                Status::Expired,
            ],
            // Running -> Running is a retry: same record, new attempt.
            Status::Running => vec![
                Status::Running,
                Status::Suspended,
                Status::Succeeded,
                Status::Failed,
                Status::IgnoreFailed,
                Status::Aborted,
                Status::Expired,
            ],
            Status::Suspended => vec![
                Status::Running,
                Status::Failed,
                Status::Aborted,
                Status::Expired,
            ],
            Status::Succeeded
            | Status::Failed
            | Status::IgnoreFailed
            | Status::Aborted
            | Status::Expired => vec![],
        }
    }

    pub fn can_transition(from: &Status, to: &Status) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

pub struct PlanStateMachine;

impl PlanStateMachine {
    pub fn validate_transition(from: &PlanStatus, to: &PlanStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &PlanStatus) -> Vec<PlanStatus> {
        match from {
            PlanStatus::Running => vec![
                PlanStatus::Paused,
                PlanStatus::Succeeded,
                PlanStatus::Failed,
                PlanStatus::Aborted,
                PlanStatus::Expired,
            ],
            PlanStatus::Paused => vec![
                PlanStatus::Running,
                PlanStatus::Succeeded,
                PlanStatus::Failed,
                PlanStatus::Aborted,
                PlanStatus::Expired,
            ],
            PlanStatus::Succeeded
            | PlanStatus::Failed
            | PlanStatus::Aborted
            | PlanStatus::Expired => vec![],
        }
    }

    pub fn can_transition(from: &PlanStatus, to: &PlanStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_node_transitions() {
        assert!(NodeStateMachine::can_transition(
            &Status::Queued,
            &Status::Running
        ));
        assert!(NodeStateMachine::can_transition(
            &Status::Running,
            &Status::Running
        ));
        assert!(NodeStateMachine::can_transition(
            &Status::Running,
            &Status::Suspended
        ));
        assert!(NodeStateMachine::can_transition(
            &Status::Suspended,
            &Status::Aborted
        ));
    }

    #[test]
    fn test_invalid_node_transitions() {
        assert!(!NodeStateMachine::can_transition(
            &Status::Queued,
            &Status::Succeeded
        ));
        assert!(!NodeStateMachine::can_transition(
            &Status::Queued,
            &Status::Suspended
        ));
        assert!(!NodeStateMachine::can_transition(
            &Status::Suspended,
            &Status::Succeeded
        ));
    }

    #[test]
    fn test_terminal_node_statuses_are_final() {
        for terminal in [
            Status::Succeeded,
            Status::Failed,
            Status::IgnoreFailed,
            Status::Aborted,
            Status::Expired,
        ] {
            assert!(!NodeStateMachine::can_transition(&terminal, &Status::Running));
            assert!(!NodeStateMachine::can_transition(&terminal, &Status::Aborted));
        }
    }

    #[test]
    fn test_plan_transitions() {
        assert!(PlanStateMachine::can_transition(
            &PlanStatus::Running,
            &PlanStatus::Paused
        ));
        assert!(PlanStateMachine::can_transition(
            &PlanStatus::Paused,
            &PlanStatus::Running
        ));
        assert!(PlanStateMachine::can_transition(
            &PlanStatus::Paused,
            &PlanStatus::Aborted
        ));
        assert!(!PlanStateMachine::can_transition(
            &PlanStatus::Aborted,
            &PlanStatus::Running
        ));
    }

    #[test]
    fn test_transition_error_names_statuses() {
        let err = NodeStateMachine::validate_transition(&Status::Succeeded, &Status::Running)
            .unwrap_err();
        assert!(err.to_string().contains("succeeded"));
        assert!(err.to_string().contains("running"));
    }
}
