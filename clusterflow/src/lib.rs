//! # Clusterflow
//!
//! The orchestration core of a cloud cluster lifecycle service.
//!
//! Clusterflow drives long-running operations (create a cluster, add or
//! remove nodes) as tasks made of named steps:
//!
//! - **Resumable steps**: a step that already succeeded is never run again,
//!   so a crashed or failed task resumes where it stopped
//! - **Shared parameter bus**: steps hand data to later steps through the
//!   task record
//! - **Polling**: bounded waits on eventually-consistent cloud state
//! - **Subnet allocation**: conflict-free CIDR carving under a distributed
//!   lock
//! - **Bounded fan-out**: per-item provider calls with partial-failure
//!   bookkeeping
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clusterflow::prelude::*;
//!
//! let task = add_nodes_task("t-1", &target, &NodeSpec { count: 3, instance_type })?;
//! store.save_task(&task).await?;
//!
//! let engine = Engine::new(store, EngineConfig::default())
//!     .with_builtin_handlers(nodes, subnets);
//! let report = engine.run_task("t-1").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cidr;
pub mod concurrency;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod lock;
pub mod observability;
pub mod polling;
pub mod provider;
pub mod retry;
pub mod task;
pub mod testing;
pub mod workflows;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::cidr::{
        allocate_from_free, free_blocks, AddressBlock, AllocationPolicy, SubnetAllocator,
        VpcNetworkProvider, VpcRef,
    };
    pub use crate::config::EngineConfig;
    pub use crate::core::{Step, StepStatus, Task, TaskStatus};
    pub use crate::engine::{Engine, StepRun, TaskReport};
    pub use crate::errors::{
        CidrError, ClusterflowError, LockError, ProviderError, StepFailure, TaskError,
    };
    pub use crate::handlers::{StepContext, StepHandler};
    pub use crate::lock::{DistributedLock, InMemoryLockBackend, LockBackend};
    pub use crate::observability::{init_tracing, LogConfig};
    pub use crate::polling::{loop_do, PollConfig, PollContext, Probe};
    pub use crate::provider::NodeProvider;
    pub use crate::retry::{retry, RetryPolicy};
    pub use crate::task::{
        get_current_step, CommonParams, InMemoryTaskStore, PartialFailurePolicy, TaskState,
        TaskStore,
    };
    pub use crate::workflows::{
        add_nodes_task, create_cluster_task, remove_nodes_task, ClusterNetwork,
        NodeGroupTarget, NodeSpec,
    };
}
