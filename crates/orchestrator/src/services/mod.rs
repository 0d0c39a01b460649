pub mod engine_context;
pub mod resolver;
pub mod task_dispatcher;

pub use engine_context::EngineContext;
pub use resolver::{ParameterResolver, TemplateResolver};
pub use task_dispatcher::{InProcessTaskDispatcher, TaskDispatcher};
