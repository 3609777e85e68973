//! Vendor-agnostic cloud provider contracts.
//!
//! Handlers talk to a cloud only through these traits. A provider
//! implementation maps its SDK errors onto [`ProviderError`] kinds so the
//! retry wrapper can tell transient failures from permanent ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ProviderError;

pub use crate::cidr::{Subnet, SubnetRequest, VpcNetworkProvider, VpcRef};

/// Instances to launch in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    /// Cluster the instances join.
    pub cluster_id: String,
    /// Node group the instances belong to.
    pub node_group_id: String,
    /// Number of instances.
    pub count: usize,
    /// Instance type.
    #[serde(default)]
    pub instance_type: String,
    /// Subnet to launch in.
    #[serde(default)]
    pub subnet_id: String,
    /// Idempotency token for the launch call.
    #[serde(default)]
    pub client_token: String,
}

/// Lifecycle state of an instance as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Still launching.
    Pending,
    /// Up and reachable.
    Running,
    /// Launch failed.
    Failed,
    /// Shutting down.
    Terminating,
    /// Gone.
    Terminated,
}

impl InstanceState {
    /// Returns true if the instance will not change state on its own
    /// towards running.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Terminating => write!(f, "terminating"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// An instance as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance id.
    pub id: String,
    /// Current state.
    pub state: InstanceState,
    /// Private IP, once assigned.
    #[serde(default)]
    pub private_ip: Option<String>,
}

/// Compute operations on instances.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Launches instances and returns their ids.
    async fn create_instances(&self, request: &InstanceRequest)
        -> Result<Vec<String>, ProviderError>;

    /// Describes one instance.
    async fn describe_instance(&self, id: &str) -> Result<InstanceInfo, ProviderError>;

    /// Requests deletion. Unknown ids are reported as `NotFound`.
    async fn delete_instances(&self, ids: &[String]) -> Result<(), ProviderError>;
}
