//! The task/step state machine.
//!
//! This module provides:
//! - Task persistence behind the [`TaskStore`] trait
//! - Step dispatch with skip-on-retry ([`get_current_step`])
//! - Success/failure transitions on [`TaskState`]
//! - The shared parameter bus and its typed views
//! - Partial-failure bookkeeping for batch steps

mod params;
mod partial;
mod state;
mod store;

pub use params::{
    keys, AddNodesParams, CommonParams, CreateClusterParams, RemoveNodesParams, LIST_SEPARATOR,
};
pub use partial::{apply_batch_outcome, BatchDecision, BatchOutcome, PartialFailurePolicy};
pub use state::{get_current_step, TaskState};
pub use store::{InMemoryTaskStore, TaskStore};
