//! Ordered event emitter with sequence guarantees.
//!
//! Every event the engine publishes gets the next number of one shared
//! counter, so consumers can order events even when several workers publish
//! concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use events::{Event, EventDispatcher, EventEnvelope, PublishOutcome};

#[derive(Clone)]
pub struct OrderedEventEmitter {
    dispatcher: EventDispatcher,
    sequence: Arc<AtomicU64>,
}

impl OrderedEventEmitter {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            dispatcher,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamps the next sequence number and hands the event to the dispatcher.
    pub fn emit(&self, event: Event) -> PublishOutcome {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.dispatcher
            .publish(EventEnvelope::with_sequence(event, sequence))
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}
