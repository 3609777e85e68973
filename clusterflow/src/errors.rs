//! Error types for the clusterflow orchestration core.
//!
//! Each subsystem owns a focused error type; [`ClusterflowError`] is the
//! crate-level error that step handlers and the engine deal in.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for clusterflow operations.
#[derive(Debug, Error)]
pub enum ClusterflowError {
    /// Task or step persistence failed.
    #[error("{0}")]
    Task(#[from] TaskError),

    /// Address block allocation failed.
    #[error("{0}")]
    Cidr(#[from] CidrError),

    /// The distributed lock could not be taken or released.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// A cloud provider call failed.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// Waiting on an asynchronous cloud operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A step failed; carries the identifiers needed to locate the cause.
    #[error("{0}")]
    StepFailed(#[from] StepFailure),

    /// A step handler rejected its input or state.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ClusterflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by the task store and the step state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// No task is stored under the id.
    #[error("task '{task_id}' not found")]
    TaskNotFound {
        /// The missing task id.
        task_id: String,
    },

    /// The task has no step with the requested name.
    #[error("task '{task_id}' has no step '{step}'")]
    StepNotFound {
        /// The task id.
        task_id: String,
        /// The missing step name.
        step: String,
    },

    /// A step name appears twice in one task.
    #[error("task '{task_id}' already contains step '{step}'")]
    DuplicateStep {
        /// The task id.
        task_id: String,
        /// The duplicated step name.
        step: String,
    },

    /// The backing store could not be reached or rejected the write.
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    /// The stored record could not be encoded or decoded.
    #[error("task serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised by the CIDR block allocator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CidrError {
    /// The requested prefix length is outside `0..=32`.
    #[error("invalid mask length {mask_length}, expected 0..=32")]
    InvalidMaskLength {
        /// The rejected prefix length.
        mask_length: u8,
    },

    /// A block string could not be parsed.
    #[error("invalid address block '{0}'")]
    InvalidBlock(String),

    /// There are no parent blocks to allocate from.
    #[error("no parent address blocks to allocate from")]
    NoParentBlocks,

    /// No single free block can hold the requested prefix.
    #[error("no free address block can hold a /{mask_length}")]
    NoCapacity {
        /// The requested prefix length.
        mask_length: u8,
    },
}

/// Errors raised by the distributed lock.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The lease could not be obtained before the acquire timeout.
    #[error("timed out after {waited_ms}ms acquiring lock '{key}'")]
    AcquireTimeout {
        /// The lock key.
        key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The caller released a lease it no longer holds.
    #[error("lock '{key}' is not held by this holder")]
    NotHeld {
        /// The lock key.
        key: String,
    },

    /// The lock backend failed.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Throttling, network blips and other failures worth retrying.
    Transient,
    /// The resource does not exist.
    NotFound,
    /// The resource was already created.
    AlreadyExists,
    /// Anything that will not succeed on retry.
    Fatal,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::NotFound => write!(f, "not_found"),
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error returned by a cloud provider client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    /// The failure class.
    pub kind: ProviderErrorKind,
    /// The provider's message.
    pub message: String,
}

impl ProviderError {
    /// Creates a provider error of the given kind.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, message)
    }

    /// Returns true if retrying the call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    /// Returns true if the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// A failed step, described with enough identifiers to find the cause.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("task {task_id} step {step} failed (cluster={cluster_id}, nodegroup={node_group_id}): {message}")]
pub struct StepFailure {
    /// The task id.
    pub task_id: String,
    /// The failed step.
    pub step: String,
    /// The cluster the task belongs to.
    pub cluster_id: String,
    /// The node group the task operates on, if any.
    pub node_group_id: String,
    /// Human readable cause.
    pub message: String,
}
