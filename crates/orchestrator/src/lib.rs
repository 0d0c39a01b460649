pub mod advisers;
pub mod config;
pub mod core;
pub mod error;
pub mod interrupts;
pub mod services;
pub mod state_machine;
pub mod steps;
pub mod sweeper;
pub mod wait_notify;
pub mod worker;

pub use advisers::{AdviserEngine, AdviserResponse, AdvisingEvent};
pub use config::EngineConfig;
pub use core::{
    ExecutionEngine, OrderedEventEmitter, StepContext, StepExecutor, StepOutcome, WorkDisposition,
};
pub use error::{OrchestratorError, Result};
pub use interrupts::{InterruptManager, InterruptRequest, InterruptResult, InterruptTarget};
pub use services::{
    EngineContext, InProcessTaskDispatcher, ParameterResolver, TaskDispatcher, TemplateResolver,
};
pub use state_machine::{NodeStateMachine, PlanStateMachine};
pub use steps::StepRegistry;
pub use sweeper::{ExpirySweeper, SweepReport};
pub use wait_notify::{NotifyOutcome, WaitNotifyService};
pub use worker::WorkerPool;
