pub mod adviser;
pub mod ambiance;
pub mod failure;
pub mod interrupt;
pub mod node_execution;
pub mod plan;
pub mod plan_execution;
pub mod status;
pub mod wait;
pub mod work;

pub use adviser::{
    matches_failure_codes, AdviserObtainment, BackoffPolicy, EndPlanAdviser,
    IgnoreFailureAdviser, MarkSuccessAdviser, OnFailAdviser, OnSuccessAdviser, RepairAction,
    RetryAdviser,
};
pub use ambiance::{Ambiance, Level, LevelGroup};
pub use failure::{FailureData, FailureInfo, CHILD_FAILED, ENGINE_INTERNAL_ERROR, EXPRESSION_ERROR};
pub use interrupt::{Interrupt, InterruptEffect, InterruptState, InterruptType};
pub use node_execution::{ExecutableResponse, NodeExecution};
pub use plan::{FacilitationMode, Plan, PlanNode};
pub use plan_execution::{to_chrono, PlanExecution};
pub use status::{PlanStatus, Status};
pub use wait::{new_correlation_id, WaitInstance, WaitPurpose};
pub use work::{WorkItem, WorkKind};
