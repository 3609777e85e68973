//! Spans and timing around step execution.

use std::time::{Duration, Instant};
use tracing::Span;

use crate::core::Task;

/// Identifiers attached to every step span.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSpanAttributes {
    /// Task id.
    pub task_id: String,
    /// Task type.
    pub task_type: String,
    /// Step name.
    pub step: String,
    /// Cluster id.
    pub cluster_id: String,
    /// Node group id.
    pub node_group_id: String,
}

impl StepSpanAttributes {
    /// Collects the identifiers of `step` in `task`.
    #[must_use]
    pub fn from_task(task: &Task, step: &str) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            step: step.to_string(),
            cluster_id: task.cluster_id.clone(),
            node_group_id: task.node_group_id.clone(),
        }
    }
}

/// Opens the span a step handler runs in.
#[must_use]
pub fn step_span(attrs: &StepSpanAttributes) -> Span {
    tracing::info_span!(
        "step",
        task_id = %attrs.task_id,
        task_type = %attrs.task_type,
        step = %attrs.step,
        cluster_id = %attrs.cluster_id,
        node_group_id = %attrs.node_group_id,
    )
}

/// Wall-clock timer for a step.
#[derive(Debug, Clone)]
pub struct StepTimer {
    start: Instant,
    step: String,
}

impl StepTimer {
    /// Starts timing `step`.
    #[must_use]
    pub fn start(step: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            step: step.into(),
        }
    }

    /// The instant timing started.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// The timed step.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Time since start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
