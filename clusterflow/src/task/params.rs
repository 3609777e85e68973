//! The task-scoped parameter bus and its typed per-workflow views.
//!
//! The bus itself stays a flat string map on the task record so any store
//! can persist it. Handlers go through the typed views below instead of
//! spelling keys by hand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Separator used for list values on the bus.
pub const LIST_SEPARATOR: char = ',';

/// Well-known bus keys.
pub mod keys {
    /// Instance ids returned by the create call.
    pub const INSTANCE_IDS: &str = "instanceIDs";
    /// Instances that reached the running state.
    pub const SUCCESS_INSTANCE_IDS: &str = "successInstanceIDs";
    /// Instances that failed to come up.
    pub const FAILED_INSTANCE_IDS: &str = "failedInstanceIDs";
    /// Private IPs of the surviving instances.
    pub const NODE_IPS: &str = "nodeIPs";
    /// Surviving instances whose private IP could not be resolved.
    pub const UNRESOLVED_INSTANCE_IDS: &str = "unresolvedInstanceIDs";
    /// Instances selected for removal.
    pub const DELETE_INSTANCE_IDS: &str = "deleteInstanceIDs";
    /// Subnet created for the cluster.
    pub const SUBNET_ID: &str = "subnetID";
    /// Address block of that subnet.
    pub const SUBNET_CIDR: &str = "subnetCIDR";
    /// VPC the cluster lives in.
    pub const VPC_ID: &str = "vpcID";
    /// Region of the VPC.
    pub const REGION: &str = "region";
    /// Availability zone for new subnets and nodes.
    pub const ZONE: &str = "zone";
}

/// Flat, last-writer-wins string map shared by all steps of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommonParams(BTreeMap<String, String>);

impl CommonParams {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Checks if a key exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Reads a comma-joined list. Missing keys and empty values yield an
    /// empty list.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(LIST_SEPARATOR)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Writes a list as a comma-joined value.
    pub fn set_list<S: AsRef<str>>(&mut self, key: impl Into<String>, values: &[S]) {
        let joined = values
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(&LIST_SEPARATOR.to_string());
        self.set(key, joined);
    }

    /// Parses a value. Returns `None` when the key is missing or does not
    /// parse.
    #[must_use]
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the bus is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Bus view for the add-nodes workflow.
#[derive(Debug)]
pub struct AddNodesParams<'a> {
    params: &'a mut CommonParams,
}

impl<'a> AddNodesParams<'a> {
    /// Wraps the bus.
    pub fn new(params: &'a mut CommonParams) -> Self {
        Self { params }
    }

    /// Instances created by the apply step.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> {
        self.params.get_list(keys::INSTANCE_IDS)
    }

    /// Records the instances created by the apply step.
    pub fn set_instance_ids(&mut self, ids: &[String]) {
        self.params.set_list(keys::INSTANCE_IDS, ids);
    }

    /// Instances that came up.
    #[must_use]
    pub fn success_instance_ids(&self) -> Vec<String> {
        self.params.get_list(keys::SUCCESS_INSTANCE_IDS)
    }

    /// Records the instances that came up.
    pub fn set_success_instance_ids(&mut self, ids: &[String]) {
        self.params.set_list(keys::SUCCESS_INSTANCE_IDS, ids);
    }

    /// Instances that did not come up.
    #[must_use]
    pub fn failed_instance_ids(&self) -> Vec<String> {
        self.params.get_list(keys::FAILED_INSTANCE_IDS)
    }

    /// Records the instances that did not come up.
    pub fn set_failed_instance_ids(&mut self, ids: &[String]) {
        self.params.set_list(keys::FAILED_INSTANCE_IDS, ids);
    }

    /// Private IPs of the surviving nodes.
    #[must_use]
    pub fn node_ips(&self) -> Vec<String> {
        self.params.get_list(keys::NODE_IPS)
    }

    /// Records the private IPs of the surviving nodes.
    pub fn set_node_ips(&mut self, ips: &[String]) {
        self.params.set_list(keys::NODE_IPS, ips);
    }
}

/// Bus view for the create-cluster workflow.
#[derive(Debug)]
pub struct CreateClusterParams<'a> {
    params: &'a mut CommonParams,
}

impl<'a> CreateClusterParams<'a> {
    /// Wraps the bus.
    pub fn new(params: &'a mut CommonParams) -> Self {
        Self { params }
    }

    /// VPC id.
    #[must_use]
    pub fn vpc_id(&self) -> Option<String> {
        self.params.get(keys::VPC_ID).map(ToString::to_string)
    }

    /// Region of the VPC.
    #[must_use]
    pub fn region(&self) -> Option<String> {
        self.params.get(keys::REGION).map(ToString::to_string)
    }

    /// Zone for the subnet.
    #[must_use]
    pub fn zone(&self) -> Option<String> {
        self.params.get(keys::ZONE).map(ToString::to_string)
    }

    /// Subnet created for the cluster, if any.
    #[must_use]
    pub fn subnet_id(&self) -> Option<String> {
        self.params.get(keys::SUBNET_ID).map(ToString::to_string)
    }

    /// Address block of the created subnet, if any.
    #[must_use]
    pub fn subnet_cidr(&self) -> Option<String> {
        self.params.get(keys::SUBNET_CIDR).map(ToString::to_string)
    }

    /// Records the subnet created for the cluster.
    pub fn set_subnet(&mut self, subnet_id: &str, cidr: &str) {
        self.params.set(keys::SUBNET_ID, subnet_id);
        self.params.set(keys::SUBNET_CIDR, cidr);
    }
}

/// Bus view for the remove-nodes workflow.
#[derive(Debug)]
pub struct RemoveNodesParams<'a> {
    params: &'a mut CommonParams,
}

impl<'a> RemoveNodesParams<'a> {
    /// Wraps the bus.
    pub fn new(params: &'a mut CommonParams) -> Self {
        Self { params }
    }

    /// Instances selected for removal.
    #[must_use]
    pub fn delete_instance_ids(&self) -> Vec<String> {
        self.params.get_list(keys::DELETE_INSTANCE_IDS)
    }

    /// Records the instances selected for removal.
    pub fn set_delete_instance_ids(&mut self, ids: &[String]) {
        self.params.set_list(keys::DELETE_INSTANCE_IDS, ids);
    }
}
