//! The live task handle and step transitions.
//!
//! A [`TaskState`] is exclusively owned by the handler currently running a
//! step of the task. Steps of one task run strictly in sequence: callers
//! must not hold two `TaskState`s for the same task at once (the engine
//! can enforce this in-process, see `EngineConfig::serialize_steps_per_task`).

use chrono::Utc;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{CommonParams, TaskStore};
use crate::core::{Step, StepStatus, Task, TaskStatus};
use crate::errors::TaskError;

/// A task loaded for execution, together with the store it persists to.
pub struct TaskState {
    task: Task,
    store: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("task_id", &self.task.task_id)
            .field("status", &self.task.status)
            .field("current_step", &self.task.current_step)
            .finish()
    }
}

/// Loads a task and the named step, preparing the step to run.
///
/// Returns `None` for the step when it already succeeded: the caller must
/// then return success without side effects. Otherwise the step is marked
/// running and the task persisted before it is handed out.
///
/// # Errors
///
/// Returns `TaskError::StepNotFound` when the task has no such step and
/// propagates store failures.
pub async fn get_current_step(
    store: Arc<dyn TaskStore>,
    task_id: &str,
    step_name: &str,
) -> Result<(TaskState, Option<Step>), TaskError> {
    let task = store.load_task(task_id).await?;
    let mut state = TaskState::new(task, store);

    let step = state
        .task
        .step_mut(step_name)
        .ok_or_else(|| TaskError::StepNotFound {
            task_id: task_id.to_string(),
            step: step_name.to_string(),
        })?;

    if step.is_done() {
        debug!(task_id, step = step_name, "step already succeeded, skipping");
        return Ok((state, None));
    }

    if step.status == StepStatus::Failure {
        step.retry_count += 1;
    }
    if step.start_at.is_none() {
        step.start_at = Some(Utc::now());
    }
    step.transition(StepStatus::Running, "");
    let step = step.clone();

    state.task.status = TaskStatus::Running;
    state.task.current_step = step_name.to_string();
    // a partial-failure message names the failed items and must survive
    // until the task finishes
    if !state.task.part_failure {
        state.task.message = format!("step {step_name} running");
    }
    state.save().await?;

    info!(
        task_id,
        step = step_name,
        retry_count = step.retry_count,
        "step dispatched"
    );
    Ok((state, Some(step)))
}

impl TaskState {
    /// Wraps an already loaded task.
    #[must_use]
    pub fn new(task: Task, store: Arc<dyn TaskStore>) -> Self {
        Self { task, store }
    }

    /// Returns the task record.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Returns the task id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    /// Returns the parameter bus.
    #[must_use]
    pub fn params(&self) -> &CommonParams {
        &self.task.common_params
    }

    /// Returns the parameter bus for writing. Writes are persisted by the
    /// next step transition.
    pub fn params_mut(&mut self) -> &mut CommonParams {
        &mut self.task.common_params
    }

    /// Replaces the node IP result list.
    pub fn set_node_ips(&mut self, ips: Vec<String>) {
        self.task.node_ip_list = ips;
    }

    /// Records a degraded-success outcome.
    pub fn mark_part_failure(&mut self, message: impl Into<String>) {
        self.task.part_failure = true;
        self.task.message = message.into();
    }

    /// Returns true if the named step already succeeded.
    #[must_use]
    pub fn is_step_done(&self, step_name: &str) -> bool {
        self.task.step(step_name).is_some_and(Step::is_done)
    }

    /// Marks the step successful and persists the whole task, including
    /// every bus and result-list change made since it was loaded.
    ///
    /// The step does not count as done until this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::StepNotFound` for an unknown step and propagates
    /// store failures.
    pub async fn update_step_success(
        &mut self,
        start: Instant,
        step_name: &str,
    ) -> Result<(), TaskError> {
        let elapsed = start.elapsed().as_secs_f64();
        let step = self.step_mut(step_name)?;
        step.end_at = Some(Utc::now());
        step.execution_secs = elapsed;
        step.transition(StepStatus::Success, format!("step {step_name} succeeded"));

        if self.task.is_last_step(step_name) {
            self.finish(TaskStatus::Success);
            if !self.task.part_failure {
                self.task.message = "task finished successfully".to_string();
            }
        } else if !self.task.part_failure {
            self.task.message = format!("step {step_name} succeeded");
        }

        self.save().await?;
        info!(
            task_id = %self.task.task_id,
            step = step_name,
            elapsed_secs = elapsed,
            "step succeeded"
        );
        Ok(())
    }

    /// Marks the step failed and persists.
    ///
    /// The task is halted unless the step is `skip_on_failure`, in which case
    /// the task records a partial failure and keeps going (or finishes if
    /// this was its last step).
    ///
    /// # Errors
    ///
    /// Returns `TaskError::StepNotFound` for an unknown step and propagates
    /// store failures.
    pub async fn update_step_failure(
        &mut self,
        start: Instant,
        step_name: &str,
        err: &(dyn Display + Sync),
    ) -> Result<(), TaskError> {
        let elapsed = start.elapsed().as_secs_f64();
        let cause = err.to_string();
        let step = self.step_mut(step_name)?;
        step.end_at = Some(Utc::now());
        step.execution_secs = elapsed;
        step.transition(StepStatus::Failure, cause.clone());
        let skip = step.skip_on_failure;

        let message = format!("step {step_name} failed: {cause}");
        if skip {
            self.task.part_failure = true;
            self.task.message = message;
            if self.task.is_last_step(step_name) {
                self.finish(TaskStatus::Success);
            }
        } else {
            self.task.message = message;
            self.finish(TaskStatus::Failure);
        }

        self.save().await?;
        warn!(
            task_id = %self.task.task_id,
            step = step_name,
            error = %cause,
            skip_on_failure = skip,
            "step failed"
        );
        Ok(())
    }

    /// Returns true if the task stopped because of a hard failure.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.task.status == TaskStatus::Failure
    }

    /// Consumes the handle, returning the task record.
    #[must_use]
    pub fn into_task(self) -> Task {
        self.task
    }

    fn step_mut(&mut self, step_name: &str) -> Result<&mut Step, TaskError> {
        let task_id = self.task.task_id.clone();
        self.task
            .step_mut(step_name)
            .ok_or_else(|| TaskError::StepNotFound {
                task_id,
                step: step_name.to_string(),
            })
    }

    fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.task.status = status;
        self.task.finished_at = Some(now);
        self.task.execution_secs = (now - self.task.created_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }

    async fn save(&mut self) -> Result<(), TaskError> {
        self.task.updated_at = Utc::now();
        self.store.save_task(&self.task).await
    }
}
