pub(crate) mod interrupt_repository;
pub(crate) mod node_execution_repository;
pub(crate) mod plan_execution_repository;
pub(crate) mod wait_repository;
pub(crate) mod work_queue_repository;

pub use interrupt_repository::*;
pub use node_execution_repository::*;
pub use plan_execution_repository::*;
pub use wait_repository::*;
pub use work_queue_repository::*;

pub(crate) use interrupt_repository as interrupts;
pub(crate) use node_execution_repository as nodes;
pub(crate) use plan_execution_repository as plans;
pub(crate) use wait_repository as waits;
pub(crate) use work_queue_repository as work;
