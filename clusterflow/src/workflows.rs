//! Built-in workflow definitions.
//!
//! Each builder returns a task record with its fixed linear step sequence
//! and the bus entries the first step needs. Persist it with a
//! [`TaskStore`](crate::task::TaskStore) and hand its id to
//! [`Engine::run_task`](crate::engine::Engine::run_task).

use serde::{Deserialize, Serialize};

use crate::core::{Step, Task};
use crate::errors::TaskError;
use crate::handlers::{step_params, steps};
use crate::task::keys;

/// Task type names.
pub mod task_types {
    /// Create a cluster with its subnet and first nodes.
    pub const CREATE_CLUSTER: &str = "create-cluster";
    /// Add nodes to an existing node group.
    pub const ADD_NODES: &str = "add-nodes";
    /// Remove nodes from a node group.
    pub const REMOVE_NODES: &str = "remove-nodes";
}

/// Step system tags.
const SYSTEM_COMPUTE: &str = "compute";
const SYSTEM_NETWORK: &str = "network";

/// The cluster and node group a task acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupTarget {
    /// Cloud provider name.
    pub provider: String,
    /// Cluster id.
    pub cluster_id: String,
    /// Node group id.
    pub node_group_id: String,
}

impl NodeGroupTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        cluster_id: impl Into<String>,
        node_group_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            cluster_id: cluster_id.into(),
            node_group_id: node_group_id.into(),
        }
    }

    fn task(&self, task_id: &str, task_type: &str) -> Task {
        Task::new(task_id, task_type)
            .with_provider(self.provider.clone())
            .with_cluster(self.cluster_id.clone())
            .with_node_group(self.node_group_id.clone())
    }
}

/// Nodes to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Number of instances.
    pub count: usize,
    /// Instance type.
    pub instance_type: String,
}

/// Where a new cluster's subnet is carved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    /// VPC id.
    pub vpc_id: String,
    /// Region.
    pub region: String,
    /// Zone of the subnet and nodes.
    pub zone: String,
    /// Prefix length of the subnet.
    pub mask_length: u8,
}

fn launch_steps(task: Task, nodes: &NodeSpec) -> Result<Task, TaskError> {
    task.with_step(
        Step::new(steps::APPLY_INSTANCES, SYSTEM_COMPUTE)
            .with_param(step_params::INSTANCE_COUNT, nodes.count.to_string())
            .with_param(step_params::INSTANCE_TYPE, nodes.instance_type.clone()),
    )?
    .with_step(Step::new(steps::WAIT_INSTANCES, SYSTEM_COMPUTE))?
    .with_step(Step::new(steps::RESOLVE_NODE_IPS, SYSTEM_COMPUTE))
}

/// Builds an add-nodes task: launch, wait until running, resolve IPs.
pub fn add_nodes_task(
    task_id: &str,
    target: &NodeGroupTarget,
    nodes: &NodeSpec,
) -> Result<Task, TaskError> {
    launch_steps(target.task(task_id, task_types::ADD_NODES), nodes)
}

/// Builds a create-cluster task: allocate the subnet, then launch the
/// first nodes into it.
pub fn create_cluster_task(
    task_id: &str,
    target: &NodeGroupTarget,
    network: &ClusterNetwork,
    nodes: &NodeSpec,
) -> Result<Task, TaskError> {
    let task = target
        .task(task_id, task_types::CREATE_CLUSTER)
        .with_common_param(keys::VPC_ID, network.vpc_id.clone())
        .with_common_param(keys::REGION, network.region.clone())
        .with_common_param(keys::ZONE, network.zone.clone())
        .with_step(
            Step::new(steps::ALLOCATE_SUBNET, SYSTEM_NETWORK)
                .with_param(step_params::MASK_LENGTH, network.mask_length.to_string()),
        )?;
    launch_steps(task, nodes)
}

/// Builds a remove-nodes task deleting `instance_ids`.
pub fn remove_nodes_task(
    task_id: &str,
    target: &NodeGroupTarget,
    instance_ids: &[String],
) -> Result<Task, TaskError> {
    let mut task = target
        .task(task_id, task_types::REMOVE_NODES)
        .with_step(Step::new(steps::DELETE_INSTANCES, SYSTEM_COMPUTE))?;
    task.common_params
        .set_list(keys::DELETE_INSTANCE_IDS, instance_ids);
    Ok(task)
}
