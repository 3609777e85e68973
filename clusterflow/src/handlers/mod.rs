//! Step handlers.
//!
//! A handler does the work of one named step. It reads its inputs from the
//! task's parameter bus, talks to the cloud through the provider traits and
//! writes its outputs back to the bus; the engine persists the result
//! through the step transition.
//!
//! Handlers that create resources check the bus first so that re-running a
//! step after a crash does not create them twice.

mod instances;
mod nodes;
mod subnet;

use async_trait::async_trait;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::core::{Step, Task};
use crate::errors::ClusterflowError;
use crate::polling::PollContext;
use crate::task::{PartialFailurePolicy, TaskState};

pub use instances::{ApplyInstancesHandler, WaitInstancesHandler};
pub use nodes::{DeleteInstancesHandler, ResolveNodeIpsHandler};
pub use subnet::AllocateSubnetHandler;

/// Step names used by the built-in workflows.
pub mod steps {
    /// Carve and register the cluster subnet.
    pub const ALLOCATE_SUBNET: &str = "allocateSubnet";
    /// Launch instances.
    pub const APPLY_INSTANCES: &str = "applyInstances";
    /// Wait for launched instances to run.
    pub const WAIT_INSTANCES: &str = "waitInstances";
    /// Collect private IPs of running instances.
    pub const RESOLVE_NODE_IPS: &str = "resolveNodeIps";
    /// Delete instances and wait until they are gone.
    pub const DELETE_INSTANCES: &str = "deleteInstances";
}

/// Step parameter keys read by the built-in handlers.
pub mod step_params {
    /// Prefix length of the subnet to allocate.
    pub const MASK_LENGTH: &str = "maskLength";
    /// Number of instances to launch.
    pub const INSTANCE_COUNT: &str = "count";
    /// Instance type to launch.
    pub const INSTANCE_TYPE: &str = "instanceType";
}

/// Per-run context handed to a handler.
#[derive(Debug, Clone)]
pub struct StepContext {
    task_id: String,
    step: String,
    config: Arc<EngineConfig>,
    cancellation: Arc<CancellationToken>,
}

impl StepContext {
    /// Creates a context for one step run.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        step: impl Into<String>,
        config: Arc<EngineConfig>,
        cancellation: Arc<CancellationToken>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            step: step.into(),
            config,
            cancellation,
        }
    }

    /// Task id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Step name.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancellation token of the engine.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// The partial-failure policy for `task`: its own, else the one
    /// configured for its task type, else the engine default.
    #[must_use]
    pub fn partial_failure(&self, task: &Task) -> PartialFailurePolicy {
        task.partial_failure
            .unwrap_or_else(|| self.config.partial_failure_for(&task.task_type))
    }

    /// A poll context using the configured timeout, cancelled with the
    /// engine.
    #[must_use]
    pub fn poll_context(&self, name: &str) -> PollContext {
        PollContext::new(
            format!("{}/{}/{name}", self.task_id, self.step),
            self.config.poll.timeout(),
        )
        .with_cancellation(self.cancellation.clone())
    }
}

/// The work of one named step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The step name this handler serves.
    fn name(&self) -> &str;

    /// Runs the step. An `Err` is recorded as the step's failure.
    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut TaskState,
        step: &Step,
    ) -> Result<(), ClusterflowError>;
}

/// Reads a required step parameter.
fn required_param<'a>(step: &'a Step, key: &str) -> Result<&'a str, ClusterflowError> {
    step.param(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ClusterflowError::Handler(format!("step {} is missing parameter '{key}'", step.name))
        })
}
