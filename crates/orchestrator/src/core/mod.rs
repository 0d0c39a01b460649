//! Core abstractions for the orchestrator execution model.
//!
//! - [`ExecutionEngine`] - walks plans node by node off the durable work queue
//! - [`StepExecutor`] - trait every step type implements
//! - [`StepOutcome`] - a step result on its way to the advisers
//! - [`OrderedEventEmitter`] - event emitter with sequence guarantees

mod events;
mod execution;
mod step;

pub use events::OrderedEventEmitter;
pub use execution::{ExecutionEngine, WorkDisposition};
pub use step::{outcome_from_response, StepContext, StepExecutor, StepOutcome};
