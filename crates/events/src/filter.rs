use std::collections::HashSet;

use crate::types::{EventEnvelope, EventType};

/// Decides which events a registered handler sees.
///
/// An empty type set matches every event type. A step-type set, when present,
/// only matches node events for those step types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    event_types: HashSet<EventType>,
    step_types: Option<HashSet<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: types.into_iter().collect(),
            step_types: None,
        }
    }

    pub fn with_step_types<S: Into<String>>(mut self, step_types: impl IntoIterator<Item = S>) -> Self {
        self.step_types = Some(step_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&envelope.event_type()) {
            return false;
        }
        match &self.step_types {
            None => true,
            Some(allowed) => envelope
                .event
                .step_type()
                .is_some_and(|step_type| allowed.contains(step_type)),
        }
    }
}
