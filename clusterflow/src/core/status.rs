//! Step and task status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not been dispatched yet.
    #[default]
    NotStarted,
    /// Step handler is executing (or crashed while executing).
    Running,
    /// Step completed successfully and must not run again.
    Success,
    /// Step failed; a later dispatch may retry it.
    Failure,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl StepStatus {
    /// Returns true if the step finished, successfully or not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns true if the step completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The status of a whole task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task was submitted, no step has run.
    #[default]
    Initializing,
    /// At least one step has been dispatched.
    Running,
    /// The last step completed.
    Success,
    /// A step failed fatally.
    Failure,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl TaskStatus {
    /// Returns true if the task reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_display() {
        assert_eq!(StepStatus::NotStarted.to_string(), "not_started");
        assert_eq!(StepStatus::Success.to_string(), "success");
        assert_eq!(StepStatus::Failure.to_string(), "failure");
    }

    #[test]
    fn test_step_status_is_terminal() {
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Failure.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::NotStarted.is_terminal());
    }

    #[test]
    fn test_task_status_default() {
        assert_eq!(TaskStatus::default(), TaskStatus::Initializing);
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
    }

    #[test]
    fn test_step_status_serialize() {
        let json = serde_json::to_string(&StepStatus::NotStarted).unwrap();
        assert_eq!(json, r#""not_started""#);

        let status: StepStatus = serde_json::from_str(r#""running""#).unwrap();
        assert_eq!(status, StepStatus::Running);
    }
}
