//! A persisted workflow instance.

use super::{Step, TaskStatus};
use crate::errors::TaskError;
use crate::task::{CommonParams, PartialFailurePolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One workflow instance: an ordered, fixed sequence of steps plus the
/// state that flows between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub task_id: String,

    /// Workflow type, e.g. `"add-nodes"`.
    pub task_type: String,

    /// Cluster the task operates on.
    #[serde(default)]
    pub cluster_id: String,

    /// Node group the task operates on, if any.
    #[serde(default)]
    pub node_group_id: String,

    /// Cloud provider tag.
    #[serde(default)]
    pub provider: String,

    /// Overall status.
    #[serde(default)]
    pub status: TaskStatus,

    /// Steps in execution order.
    pub steps: Vec<Step>,

    /// Key-value bus shared by all steps.
    #[serde(default)]
    pub common_params: CommonParams,

    /// IPs of the nodes the task produced.
    #[serde(default)]
    pub node_ip_list: Vec<String>,

    /// Set when a batch succeeded only for a subset of its items.
    #[serde(default)]
    pub part_failure: bool,

    /// Human readable outcome.
    #[serde(default)]
    pub message: String,

    /// Name of the step dispatched last.
    #[serde(default)]
    pub current_step: String,

    /// Submission time.
    pub created_at: DateTime<Utc>,

    /// Last persisted change.
    pub updated_at: DateTime<Utc>,

    /// Completion time, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Total wall time in seconds, once terminal.
    #[serde(default)]
    pub execution_secs: f64,

    /// Partial-failure policy for this task's batch steps. `None` defers
    /// to the engine configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_failure: Option<PartialFailurePolicy>,
}

impl Task {
    /// Creates an empty task.
    #[must_use]
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            cluster_id: String::new(),
            node_group_id: String::new(),
            provider: String::new(),
            status: TaskStatus::Initializing,
            steps: Vec::new(),
            common_params: CommonParams::new(),
            node_ip_list: Vec::new(),
            part_failure: false,
            message: String::new(),
            current_step: String::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            execution_secs: 0.0,
            partial_failure: None,
        }
    }

    /// Sets the cluster id.
    #[must_use]
    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    /// Sets the node group id.
    #[must_use]
    pub fn with_node_group(mut self, node_group_id: impl Into<String>) -> Self {
        self.node_group_id = node_group_id.into();
        self
    }

    /// Sets the provider tag.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Pins the partial-failure policy of this task.
    #[must_use]
    pub fn with_partial_failure(mut self, policy: PartialFailurePolicy) -> Self {
        self.partial_failure = Some(policy);
        self
    }

    /// Seeds the parameter bus.
    #[must_use]
    pub fn with_common_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.common_params.set(key, value);
        self
    }

    /// Appends a step to the sequence.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::DuplicateStep` if a step with the same name exists.
    pub fn with_step(mut self, step: Step) -> Result<Self, TaskError> {
        if self.step(&step.name).is_some() {
            return Err(TaskError::DuplicateStep {
                task_id: self.task_id,
                step: step.name,
            });
        }
        self.steps.push(step);
        Ok(self)
    }

    /// Returns the step with the given name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the step with the given name mutably.
    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Returns step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns true if `name` is the final step of the sequence.
    #[must_use]
    pub fn is_last_step(&self, name: &str) -> bool {
        self.steps.last().is_some_and(|s| s.name == name)
    }

    /// Returns the first step that has not succeeded yet.
    #[must_use]
    pub fn next_pending_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| !s.is_done())
    }
}
