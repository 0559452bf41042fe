//! Plan documents: typed model, validation, and comment-preserving
//! persistence.

pub mod store;
pub mod types;
pub mod validate;

pub use store::{PlanError, PlanFile};
pub use types::{
    ExecutionMode, ModelEscalation, Plan, PlanMeta, PlanStatus, Section, Task, TaskRunState,
    TaskStatus,
};
pub use validate::{validate, PlanValidationError};
