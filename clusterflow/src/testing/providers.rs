//! Fake cloud providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::cidr::{AddressBlock, Subnet, SubnetRequest, VpcNetworkProvider, VpcRef};
use crate::errors::ProviderError;
use crate::provider::{InstanceInfo, InstanceRequest, InstanceState, NodeProvider};

#[derive(Debug, Clone)]
struct FakeInstance {
    index: usize,
    pending_left: u32,
    deleted: bool,
    terminating_left: u32,
}

#[derive(Debug, Default)]
struct NodeState {
    next_index: usize,
    instances: BTreeMap<String, FakeInstance>,
    create_calls: usize,
    describe_calls: usize,
    delete_calls: usize,
    transient_creates_left: u32,
}

/// Compute provider that launches instances in memory.
///
/// New instances describe as `Pending` for a configurable number of
/// describes, then `Running` with a private IP, or `Failed` when their
/// launch index was marked failing.
#[derive(Debug, Default)]
pub struct FakeNodeProvider {
    state: Mutex<NodeState>,
    pending_polls: u32,
    slow: BTreeMap<usize, u32>,
    failing: BTreeSet<usize>,
    missing_ip: BTreeSet<usize>,
    lingering_deletes: u32,
}

impl FakeNodeProvider {
    /// Creates a provider whose instances run immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances stay pending for `polls` describes.
    #[must_use]
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Instances with these launch indices stay pending for `polls`
    /// describes instead.
    #[must_use]
    pub fn with_slow_indices(mut self, indices: &[usize], polls: u32) -> Self {
        self.slow.extend(indices.iter().map(|index| (*index, polls)));
        self
    }

    /// Instances with these launch indices (0-based) end up failed.
    #[must_use]
    pub fn with_failing_indices(mut self, indices: &[usize]) -> Self {
        self.failing = indices.iter().copied().collect();
        self
    }

    /// Instances with these launch indices run but never report an IP.
    #[must_use]
    pub fn with_missing_ip_indices(mut self, indices: &[usize]) -> Self {
        self.missing_ip = indices.iter().copied().collect();
        self
    }

    /// The first `n` create calls fail with a transient error.
    #[must_use]
    pub fn with_transient_create_failures(self, n: u32) -> Self {
        self.state.lock().transient_creates_left = n;
        self
    }

    /// Deleted instances describe as terminating `polls` times before
    /// they disappear.
    #[must_use]
    pub fn with_lingering_deletes(mut self, polls: u32) -> Self {
        self.lingering_deletes = polls;
        self
    }

    /// Adds a running instance that was not launched through this fake.
    #[must_use]
    pub fn with_running_instance(self, id: impl Into<String>) -> Self {
        {
            let mut state = self.state.lock();
            let index = state.next_index;
            state.next_index += 1;
            state.instances.insert(
                id.into(),
                FakeInstance {
                    index,
                    pending_left: 0,
                    deleted: false,
                    terminating_left: 0,
                },
            );
        }
        self
    }

    /// Number of create calls, including failed ones.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    /// Number of describe calls.
    #[must_use]
    pub fn describe_calls(&self) -> usize {
        self.state.lock().describe_calls
    }

    /// Number of delete calls.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    /// Ids of instances not deleted.
    #[must_use]
    pub fn live_instances(&self) -> Vec<String> {
        self.state
            .lock()
            .instances
            .iter()
            .filter(|(_, instance)| !instance.deleted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn ip_for(index: usize) -> String {
        format!("10.0.{}.{}", index / 250, index % 250 + 1)
    }
}

#[async_trait]
impl NodeProvider for FakeNodeProvider {
    async fn create_instances(
        &self,
        request: &InstanceRequest,
    ) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.transient_creates_left > 0 {
            state.transient_creates_left -= 1;
            return Err(ProviderError::transient("RequestLimitExceeded"));
        }

        let mut ids = Vec::with_capacity(request.count);
        for _ in 0..request.count {
            let index = state.next_index;
            state.next_index += 1;
            let id = format!("ins-{index:04}");
            state.instances.insert(
                id.clone(),
                FakeInstance {
                    index,
                    pending_left: self.slow.get(&index).copied().unwrap_or(self.pending_polls),
                    deleted: false,
                    terminating_left: 0,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn describe_instance(&self, id: &str) -> Result<InstanceInfo, ProviderError> {
        let mut state = self.state.lock();
        state.describe_calls += 1;

        let Some(instance) = state.instances.get_mut(id) else {
            return Err(ProviderError::not_found(format!("instance {id}")));
        };

        let (instance_state, private_ip) = if instance.deleted {
            if instance.terminating_left == 0 {
                state.instances.remove(id);
                return Err(ProviderError::not_found(format!("instance {id}")));
            }
            instance.terminating_left -= 1;
            (InstanceState::Terminating, None)
        } else if instance.pending_left > 0 {
            instance.pending_left -= 1;
            (InstanceState::Pending, None)
        } else if self.failing.contains(&instance.index) {
            (InstanceState::Failed, None)
        } else if self.missing_ip.contains(&instance.index) {
            (InstanceState::Running, None)
        } else {
            (InstanceState::Running, Some(Self::ip_for(instance.index)))
        };

        Ok(InstanceInfo {
            id: id.to_string(),
            state: instance_state,
            private_ip,
        })
    }

    async fn delete_instances(&self, ids: &[String]) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.delete_calls += 1;

        if let Some(missing) = ids.iter().find(|id| {
            state
                .instances
                .get(id.as_str())
                .map_or(true, |instance| instance.deleted)
        }) {
            return Err(ProviderError::not_found(format!("instance {missing}")));
        }
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.deleted = true;
                instance.terminating_left = self.lingering_deletes;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    allocated: Vec<AddressBlock>,
    subnets: Vec<Subnet>,
    transient_reads_left: u32,
    read_calls: usize,
}

/// VPC network held in memory.
///
/// An optional write delay widens the window between reading the
/// allocated blocks and registering a new subnet, which exposes races
/// between unlocked allocators.
#[derive(Debug, Default)]
pub struct FakeVpcNetwork {
    parents: Vec<AddressBlock>,
    state: Mutex<NetworkState>,
    write_delay: Option<Duration>,
}

impl FakeVpcNetwork {
    /// Creates a VPC with the given address blocks and no subnets.
    #[must_use]
    pub fn new(parents: Vec<AddressBlock>) -> Self {
        Self {
            parents,
            ..Self::default()
        }
    }

    /// Marks blocks as used by pre-existing subnets.
    #[must_use]
    pub fn with_allocated(self, allocated: Vec<AddressBlock>) -> Self {
        self.state.lock().allocated = allocated;
        self
    }

    /// The first `n` reads fail with a transient error.
    #[must_use]
    pub fn with_transient_read_failures(self, n: u32) -> Self {
        self.state.lock().transient_reads_left = n;
        self
    }

    /// Sleeps before each subnet registration.
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Subnets created so far, in creation order.
    #[must_use]
    pub fn subnets(&self) -> Vec<Subnet> {
        self.state.lock().subnets.clone()
    }

    /// Number of read calls, including failed ones.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }

    fn read(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.read_calls += 1;
        if state.transient_reads_left > 0 {
            state.transient_reads_left -= 1;
            return Err(ProviderError::transient("InternalError"));
        }
        Ok(())
    }
}

#[async_trait]
impl VpcNetworkProvider for FakeVpcNetwork {
    async fn vpc_cidrs(&self, _vpc: &VpcRef) -> Result<Vec<AddressBlock>, ProviderError> {
        self.read()?;
        Ok(self.parents.clone())
    }

    async fn allocated_subnets(&self, _vpc: &VpcRef) -> Result<Vec<AddressBlock>, ProviderError> {
        self.read()?;
        Ok(self.state.lock().allocated.clone())
    }

    async fn create_subnet(
        &self,
        _vpc: &VpcRef,
        request: &SubnetRequest,
        cidr: AddressBlock,
    ) -> Result<Subnet, ProviderError> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let subnet = Subnet {
            id: format!("subnet-{}", state.subnets.len() + 1),
            cidr,
            zone: request.zone.clone(),
        };
        state.allocated.push(cidr);
        state.subnets.push(subnet.clone());
        Ok(subnet)
    }
}
