//! Orchestration events: types, an explicit handler registry, and a bounded
//! dispatcher that fans accepted events out to handlers and projections.

mod bus;
mod dispatcher;
mod error;
mod filter;
mod handlers;
mod registry;
mod types;

pub use bus::EventBus;
pub use dispatcher::{DispatcherConfig, EventDispatcher, PublishOutcome};
pub use error::HandlerError;
pub use filter::EventFilter;
pub use handlers::TracingHandler;
pub use registry::{EventHandler, HandlerRegistry, Subscription};
pub use types::*;
