//! Step dispatch and linear task execution.
//!
//! The engine loads a task, skips steps that already succeeded, runs the
//! registered handler for the next one and records the outcome before
//! anything else happens. Collaborators (store, handlers and through them
//! the lock and providers) are injected; the engine holds no global state.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use crate::cancellation::CancellationToken;
use crate::cidr::SubnetAllocator;
use crate::config::EngineConfig;
use crate::core::{StepStatus, Task, TaskStatus};
use crate::errors::{ClusterflowError, StepFailure};
use crate::handlers::{
    AllocateSubnetHandler, ApplyInstancesHandler, DeleteInstancesHandler, ResolveNodeIpsHandler,
    StepContext, StepHandler, WaitInstancesHandler,
};
use crate::observability::{step_span, StepSpanAttributes, StepTimer};
use crate::provider::NodeProvider;
use crate::task::{get_current_step, TaskStore};

/// What [`Engine::run_step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRun {
    /// The handler ran and the step succeeded.
    Executed,
    /// The step had already succeeded; the handler was not called.
    AlreadyDone,
    /// The handler failed but the step is marked skip-on-failure; the task
    /// continues with a partial failure.
    FailedSkipped {
        /// The failure cause.
        message: String,
    },
}

/// Summary of a task after [`Engine::run_task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task id.
    pub task_id: String,
    /// Final status.
    pub status: TaskStatus,
    /// True if some items or skippable steps failed.
    pub part_failure: bool,
    /// Outcome message.
    pub message: String,
    /// Resolved node IPs.
    pub node_ips: Vec<String>,
    /// Status of each step, in order.
    pub steps: Vec<(String, StepStatus)>,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            part_failure: task.part_failure,
            message: task.message.clone(),
            node_ips: task.node_ip_list.clone(),
            steps: task
                .steps
                .iter()
                .map(|step| (step.name.clone(), step.status))
                .collect(),
        }
    }
}

/// Runs task steps through registered handlers.
pub struct Engine {
    store: Arc<dyn TaskStore>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    config: Arc<EngineConfig>,
    cancellation: Arc<CancellationToken>,
    task_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Engine {
    /// Creates an engine with no handlers.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, config: EngineConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            config: Arc::new(config),
            cancellation: Arc::new(CancellationToken::new()),
            task_gates: DashMap::new(),
        }
    }

    /// Registers a handler under its name, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    /// Registers the built-in handlers.
    #[must_use]
    pub fn with_builtin_handlers(
        self,
        nodes: Arc<dyn NodeProvider>,
        subnets: Arc<SubnetAllocator>,
    ) -> Self {
        self.with_handler(Arc::new(AllocateSubnetHandler::new(subnets)))
            .with_handler(Arc::new(ApplyInstancesHandler::new(nodes.clone())))
            .with_handler(Arc::new(WaitInstancesHandler::new(nodes.clone())))
            .with_handler(Arc::new(ResolveNodeIpsHandler::new(nodes.clone())))
            .with_handler(Arc::new(DeleteInstancesHandler::new(nodes)))
    }

    /// Uses `token` to cancel in-flight waits and stop `run_task`.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Names of registered handlers.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs one step of a task.
    ///
    /// A step that already succeeded is not run again. A handler failure
    /// is recorded on the task before it is returned as
    /// [`ClusterflowError::StepFailed`], naming task, cluster, node group
    /// and step.
    pub async fn run_step(&self, task_id: &str, step_name: &str) -> Result<StepRun, ClusterflowError> {
        let handler = self.handlers.get(step_name).cloned().ok_or_else(|| {
            ClusterflowError::Handler(format!("no handler registered for step '{step_name}'"))
        })?;

        let gate = self
            .config
            .serialize_steps_per_task
            .then(|| self.gate(task_id));
        let guard = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let result = self.dispatch(handler.as_ref(), task_id, step_name).await;

        drop(guard);
        drop(gate);
        self.task_gates
            .remove_if(task_id, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn dispatch(
        &self,
        handler: &dyn StepHandler,
        task_id: &str,
        step_name: &str,
    ) -> Result<StepRun, ClusterflowError> {
        let (mut state, step) = get_current_step(self.store.clone(), task_id, step_name).await?;
        let Some(step) = step else {
            return Ok(StepRun::AlreadyDone);
        };

        let attrs = StepSpanAttributes::from_task(state.task(), step_name);
        let ctx = StepContext::new(
            task_id,
            step_name,
            self.config.clone(),
            self.cancellation.clone(),
        );
        let timer = StepTimer::start(step_name);

        let result = handler
            .execute(&ctx, &mut state, &step)
            .instrument(step_span(&attrs))
            .await;

        match result {
            Ok(()) => {
                state.update_step_success(timer.started_at(), step_name).await?;
                Ok(StepRun::Executed)
            }
            Err(e) => {
                state
                    .update_step_failure(timer.started_at(), step_name, &e)
                    .await?;
                if step.skip_on_failure {
                    return Ok(StepRun::FailedSkipped {
                        message: e.to_string(),
                    });
                }
                Err(StepFailure {
                    task_id: attrs.task_id,
                    step: attrs.step,
                    cluster_id: attrs.cluster_id,
                    node_group_id: attrs.node_group_id,
                    message: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Runs every step of a task in order, stopping at the first hard
    /// failure, and reports the final state.
    ///
    /// Steps that already succeeded are skipped, so calling this again
    /// after a failure or crash resumes where the task stopped.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskReport, ClusterflowError> {
        let task = self.store.load_task(task_id).await?;
        let steps: Vec<String> = task.steps.iter().map(|s| s.name.clone()).collect();

        for step_name in &steps {
            if self.cancellation.is_cancelled() {
                return Err(ClusterflowError::Cancelled(
                    self.cancellation.reason().unwrap_or_default(),
                ));
            }
            match self.run_step(task_id, step_name).await {
                Ok(run) => {
                    info!(task_id, step = %step_name, outcome = ?run, "step finished");
                }
                Err(ClusterflowError::StepFailed(failure)) => {
                    warn!(task_id, error = %failure, "task halted");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let task = self.store.load_task(task_id).await?;
        Ok(TaskReport::from(&task))
    }

    fn gate(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.task_gates
            .entry(task_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("handlers", &self.handler_names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
