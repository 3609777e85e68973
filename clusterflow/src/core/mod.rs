//! Core domain model types for clusterflow.
//!
//! This module contains the persisted workflow records:
//! - Step and task status enums
//! - Steps with their transition history
//! - Tasks holding the ordered step sequence and the parameter bus

mod status;
mod step;
mod task;

pub use status::{StepStatus, TaskStatus};
pub use step::{Step, StepTransition};
pub use task::Task;
