//! A single named unit of work within a task.

use super::StepStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One recorded status change of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransition {
    /// Status before the change.
    pub from: StepStatus,
    /// Status after the change.
    pub to: StepStatus,
    /// When the change happened.
    pub at: DateTime<Utc>,
    /// Message attached to the change, e.g. the failure cause.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique within its task. Also selects the handler.
    pub name: String,

    /// Provider or system tag, e.g. `"tencentcloud"` or `"system"`.
    pub system: String,

    /// Static input parameters set when the task was built.
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Current status.
    #[serde(default)]
    pub status: StepStatus,

    /// Last status message.
    #[serde(default)]
    pub message: String,

    /// How many times the step was re-entered after a failure.
    #[serde(default)]
    pub retry_count: u32,

    /// Whether a failure of this step lets the task continue.
    #[serde(default)]
    pub skip_on_failure: bool,

    /// First dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,

    /// Completion time of the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,

    /// Wall time of the last attempt in seconds.
    #[serde(default)]
    pub execution_secs: f64,

    /// Every status change, oldest first.
    #[serde(default)]
    pub history: Vec<StepTransition>,
}

impl Step {
    /// Creates a not-started step.
    #[must_use]
    pub fn new(name: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: system.into(),
            params: BTreeMap::new(),
            status: StepStatus::NotStarted,
            message: String::new(),
            retry_count: 0,
            skip_on_failure: false,
            start_at: None,
            end_at: None,
            execution_secs: 0.0,
            history: Vec::new(),
        }
    }

    /// Adds a static input parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Lets the task continue when this step fails.
    #[must_use]
    pub fn skip_on_failure(mut self) -> Self {
        self.skip_on_failure = true;
        self
    }

    /// Returns a static input parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns true once the step succeeded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status.is_success()
    }

    /// Moves the step to `to`, appending the change to the history.
    pub fn transition(&mut self, to: StepStatus, message: impl Into<String>) {
        let message = message.into();
        let at = Utc::now();
        self.history.push(StepTransition {
            from: self.status,
            to,
            at,
            message: message.clone(),
        });
        self.status = to;
        self.message = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_step_defaults() {
        let step = Step::new("applyInstances", "tencentcloud").with_param("count", "3");

        assert_eq!(step.status, StepStatus::NotStarted);
        assert_eq!(step.param("count"), Some("3"));
        assert!(!step.skip_on_failure);
        assert!(!step.is_done());
    }

    #[test]
    fn test_transition_records_history() {
        let mut step = Step::new("wait", "system");
        step.transition(StepStatus::Running, "");
        step.transition(StepStatus::Failure, "describe failed");

        assert_eq!(step.status, StepStatus::Failure);
        assert_eq!(step.message, "describe failed");
        assert_eq!(step.history.len(), 2);
        assert_eq!(step.history[0].from, StepStatus::NotStarted);
        assert_eq!(step.history[1].to, StepStatus::Failure);
    }
}
