//! Partial-failure bookkeeping for batch operations.
//!
//! A batch step (create N instances, drain M nodes) can succeed for some
//! items and fail for others. Depending on the workflow the step then
//! either fails outright or records the failed subset and lets downstream
//! steps continue with the survivors.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::TaskState;
use crate::errors::ClusterflowError;

/// How a step treats a batch in which only some items succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Record the failed subset, continue with the survivors.
    #[default]
    RecordOnly,
    /// Keep the failed subset on the bus and fail the step, so that resuming
    /// the task re-runs the step for those items only.
    RetryFailedSubset,
    /// Any failed item fails the step.
    FailStep,
}

/// Result of applying one operation to every item of a batch.
///
/// Successes may carry the operation's output (`S`) while failures keep
/// the input item (`F`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome<S, F = S> {
    /// Successful results, in input order.
    pub succeeded: Vec<S>,
    /// Items that failed with their cause, in input order.
    pub failed: Vec<(F, String)>,
}

impl<S, F> Default for BatchOutcome<S, F> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<S, F> BatchOutcome<S, F> {
    /// Creates an empty outcome.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful item.
    pub fn push_success(&mut self, item: S) {
        self.succeeded.push(item);
    }

    /// Records a failed item.
    pub fn push_failure(&mut self, item: F, cause: impl Into<String>) {
        self.failed.push((item, cause.into()));
    }

    /// Total number of items.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Returns true if every item succeeded.
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns true if some, but not all, items failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !self.succeeded.is_empty()
    }
}

impl<S, F: Display> BatchOutcome<S, F> {
    /// Describes the failed items, e.g. `"2/10 items failed: [i-3: boom, i-7: boom]"`.
    #[must_use]
    pub fn failure_message(&self) -> String {
        let details: Vec<String> = self
            .failed
            .iter()
            .map(|(item, cause)| format!("{item}: {cause}"))
            .collect();
        format!(
            "{}/{} items failed: [{}]",
            self.failed.len(),
            self.total(),
            details.join(", ")
        )
    }
}

/// What the caller should do after [`apply_batch_outcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    /// Every item succeeded.
    Complete,
    /// The step continues with the survivors; the task is marked
    /// partially failed.
    Partial {
        /// Failed items.
        failed: Vec<String>,
    },
}

/// Applies a batch outcome to the task state according to `policy`.
///
/// Survivors are written to `survivors_key` on the bus. With a mixed
/// outcome under `RecordOnly` the task is marked partially failed with a
/// message naming each failed item and `failed_key` is cleared.
///
/// Under `RetryFailedSubset` the failed items are kept under `failed_key`
/// and the step fails, so that resuming the task re-enters the step with
/// only those items left to handle.
///
/// # Errors
///
/// Returns `ClusterflowError::Handler` when every item failed, or when any
/// item failed under `FailStep` or `RetryFailedSubset`. The caller turns
/// this into a step failure; bus writes made here are persisted with it.
pub fn apply_batch_outcome<S: Display, F: Display>(
    state: &mut TaskState,
    outcome: &BatchOutcome<S, F>,
    policy: PartialFailurePolicy,
    survivors_key: &str,
    failed_key: &str,
) -> Result<BatchDecision, ClusterflowError> {
    if outcome.total() > 0 && outcome.succeeded.is_empty() {
        return Err(ClusterflowError::Handler(format!(
            "all items failed: {}",
            outcome.failure_message()
        )));
    }
    if !outcome.failed.is_empty() && policy == PartialFailurePolicy::FailStep {
        return Err(ClusterflowError::Handler(outcome.failure_message()));
    }

    let survivors: Vec<String> = outcome.succeeded.iter().map(ToString::to_string).collect();
    let failed: Vec<String> = outcome.failed.iter().map(|(i, _)| i.to_string()).collect();

    let params = state.params_mut();
    params.set_list(survivors_key, &survivors);
    if policy == PartialFailurePolicy::RetryFailedSubset && !failed.is_empty() {
        params.set_list(failed_key, &failed);
        return Err(ClusterflowError::Handler(format!(
            "{}, left for retry",
            outcome.failure_message()
        )));
    }
    params.remove(failed_key);

    if failed.is_empty() {
        return Ok(BatchDecision::Complete);
    }

    state.mark_part_failure(outcome.failure_message());
    Ok(BatchDecision::Partial { failed })
}
