//! Engine configuration.
//!
//! Every field has a serde default, so a partial JSON document (or `{}`)
//! is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::cidr::AllocationPolicy;
use crate::errors::ClusterflowError;
use crate::lock::LockConfig;
use crate::observability::LogConfig;
use crate::polling::PollConfig;
use crate::retry::RetryPolicy;
use crate::task::PartialFailurePolicy;

/// Configuration shared by the engine and the built-in handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Waits on instance state.
    #[serde(default)]
    pub poll: PollConfig,
    /// Retry of individual provider calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// CIDR allocation lock.
    #[serde(default)]
    pub lock: LockConfig,
    /// Maximum concurrent provider calls in a fan-out.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Run at most one step per task at a time within this process.
    #[serde(default = "default_serialize_steps_per_task")]
    pub serialize_steps_per_task: bool,
    /// Treatment of batches that only partly succeed.
    #[serde(default)]
    pub partial_failure: PartialFailurePolicy,
    /// Per-workflow overrides of `partial_failure`, keyed by task type.
    #[serde(default)]
    pub workflow_partial_failure: BTreeMap<String, PartialFailurePolicy>,
    /// Free block selection for subnets.
    #[serde(default)]
    pub allocation_policy: AllocationPolicy,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_worker_pool_size() -> usize {
    20
}

fn default_serialize_steps_per_task() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            retry: RetryPolicy::default(),
            lock: LockConfig::default(),
            worker_pool_size: default_worker_pool_size(),
            serialize_steps_per_task: default_serialize_steps_per_task(),
            partial_failure: PartialFailurePolicy::default(),
            workflow_partial_failure: BTreeMap::new(),
            allocation_policy: AllocationPolicy::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ClusterflowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClusterflowError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClusterflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ClusterflowError> {
        if self.worker_pool_size == 0 {
            return Err(ClusterflowError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.poll.interval_ms == 0 {
            return Err(ClusterflowError::Config(
                "poll.interval_ms must be positive".to_string(),
            ));
        }
        if self.poll.timeout_ms < self.poll.interval_ms {
            return Err(ClusterflowError::Config(
                "poll.timeout_ms must not be shorter than poll.interval_ms".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ClusterflowError::Config(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.lock.ttl_ms == 0 {
            return Err(ClusterflowError::Config(
                "lock.ttl_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the polling config.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the lock config.
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the fan-out width.
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Enables or disables per-task step serialization.
    #[must_use]
    pub fn with_serialize_steps_per_task(mut self, enabled: bool) -> Self {
        self.serialize_steps_per_task = enabled;
        self
    }

    /// Sets the partial-failure policy.
    #[must_use]
    pub fn with_partial_failure(mut self, policy: PartialFailurePolicy) -> Self {
        self.partial_failure = policy;
        self
    }

    /// Overrides the partial-failure policy for one task type.
    #[must_use]
    pub fn with_workflow_partial_failure(
        mut self,
        task_type: impl Into<String>,
        policy: PartialFailurePolicy,
    ) -> Self {
        self.workflow_partial_failure.insert(task_type.into(), policy);
        self
    }

    /// The partial-failure policy for tasks of `task_type`.
    #[must_use]
    pub fn partial_failure_for(&self, task_type: &str) -> PartialFailurePolicy {
        self.workflow_partial_failure
            .get(task_type)
            .copied()
            .unwrap_or(self.partial_failure)
    }

    /// Sets the subnet allocation policy.
    #[must_use]
    pub fn with_allocation_policy(mut self, policy: AllocationPolicy) -> Self {
        self.allocation_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_workflow_partial_failure_override() {
        let config = EngineConfig::from_json_str(
            r#"{"partial_failure": "record_only",
                "workflow_partial_failure": {"create-cluster": "fail_step"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.partial_failure_for("create-cluster"),
            PartialFailurePolicy::FailStep
        );
        assert_eq!(
            config.partial_failure_for("add-nodes"),
            PartialFailurePolicy::RecordOnly
        );
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.worker_pool_size, 20);
        assert!(config.serialize_steps_per_task);
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_json_str(
            r#"{
                "poll": {"interval_ms": 1000},
                "worker_pool_size": 8,
                "partial_failure": "fail_step",
                "allocation_policy": "first_fit",
                "log": {"format": "json", "level": "debug"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.poll.interval(), Duration::from_secs(1));
        assert_eq!(config.poll.timeout(), Duration::from_secs(20 * 60));
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.partial_failure, PartialFailurePolicy::FailStep);
        assert_eq!(config.allocation_policy, AllocationPolicy::FirstFit);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_validation() {
        let err = EngineConfig::from_json_str(r#"{"worker_pool_size": 0}"#).unwrap_err();
        assert!(matches!(err, ClusterflowError::Config(_)));

        let err = EngineConfig::from_json_str(r#"{"poll": {"interval_ms": 10, "timeout_ms": 5}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("poll.timeout_ms"));

        assert!(EngineConfig::default()
            .with_retry(RetryPolicy::fixed(0, Duration::ZERO))
            .validate()
            .is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ClusterflowError::Serialization(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_path("/nonexistent/clusterflow.json").unwrap_err();
        assert!(matches!(err, ClusterflowError::Config(_)));
    }
}
