//! Locked subnet allocation against a VPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::allocate::{allocate_from_free_with, AllocationPolicy};
use super::block::{AddressBlock, MAX_PREFIX};
use super::free::free_blocks;
use crate::config::EngineConfig;
use crate::errors::{CidrError, ClusterflowError, ProviderError};
use crate::lock::{cidr_lock_key, DistributedLock, LockBackend, LockOptions};
use crate::retry::{retry_if, RetryPolicy};

/// Identifies a VPC across providers and regions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VpcRef {
    /// Provider name.
    pub provider: String,
    /// Region.
    pub region: String,
    /// VPC id.
    pub vpc_id: String,
}

impl VpcRef {
    /// Creates a VPC reference.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        region: impl Into<String>,
        vpc_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            region: region.into(),
            vpc_id: vpc_id.into(),
        }
    }

    /// Key of the lock serializing allocation in this VPC.
    #[must_use]
    pub fn lock_key(&self) -> String {
        cidr_lock_key(&self.provider, &self.region, &self.vpc_id)
    }
}

/// A subnet to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRequest {
    /// Subnet name.
    pub name: String,
    /// Availability zone.
    pub zone: String,
    /// Requested prefix length.
    pub mask_length: u8,
}

/// A created subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Provider-assigned id.
    pub id: String,
    /// Address block.
    pub cidr: AddressBlock,
    /// Availability zone.
    pub zone: String,
}

/// The VPC operations allocation needs.
#[async_trait]
pub trait VpcNetworkProvider: Send + Sync {
    /// Address blocks assigned to the VPC.
    async fn vpc_cidrs(&self, vpc: &VpcRef) -> Result<Vec<AddressBlock>, ProviderError>;

    /// Blocks already used by subnets in the VPC.
    async fn allocated_subnets(&self, vpc: &VpcRef) -> Result<Vec<AddressBlock>, ProviderError>;

    /// Registers a subnet with the given block.
    async fn create_subnet(
        &self,
        vpc: &VpcRef,
        request: &SubnetRequest,
        cidr: AddressBlock,
    ) -> Result<Subnet, ProviderError>;
}

/// Computes and registers subnets while holding the per-VPC lock.
pub struct SubnetAllocator {
    lock: DistributedLock,
    network: Arc<dyn VpcNetworkProvider>,
    retry: RetryPolicy,
    policy: AllocationPolicy,
    lock_options: LockOptions,
}

impl SubnetAllocator {
    /// Creates an allocator.
    #[must_use]
    pub fn new(
        lock: DistributedLock,
        network: Arc<dyn VpcNetworkProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            lock,
            network,
            retry,
            policy: AllocationPolicy::default(),
            lock_options: LockOptions::default(),
        }
    }

    /// Creates an allocator with the lock, retry and selection settings
    /// of `config`.
    #[must_use]
    pub fn from_config(
        config: &EngineConfig,
        backend: Arc<dyn LockBackend>,
        network: Arc<dyn VpcNetworkProvider>,
    ) -> Self {
        let lock = DistributedLock::new(backend, config.lock);
        Self::new(lock, network, config.retry).with_policy(config.allocation_policy)
    }

    /// Sets the allocation policy.
    #[must_use]
    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides lock TTL and acquire timeout.
    #[must_use]
    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    /// Reads the VPC, picks a free block and creates the subnet, all under
    /// the VPC lock. The lock is released on every path.
    pub async fn allocate_subnet(
        &self,
        vpc: &VpcRef,
        request: &SubnetRequest,
    ) -> Result<Subnet, ClusterflowError> {
        if request.mask_length > MAX_PREFIX {
            return Err(CidrError::InvalidMaskLength {
                mask_length: request.mask_length,
            }
            .into());
        }

        let key = vpc.lock_key();
        self.lock
            .with_lock(&key, self.lock_options, || self.allocate_locked(vpc, request))
            .await
    }

    async fn allocate_locked(
        &self,
        vpc: &VpcRef,
        request: &SubnetRequest,
    ) -> Result<Subnet, ClusterflowError> {
        let parents = retry_if(
            &self.retry,
            "vpc_cidrs",
            || self.network.vpc_cidrs(vpc),
            ProviderError::is_transient,
        )
        .await?;
        if parents.is_empty() {
            return Err(CidrError::NoParentBlocks.into());
        }

        let allocated = retry_if(
            &self.retry,
            "allocated_subnets",
            || self.network.allocated_subnets(vpc),
            ProviderError::is_transient,
        )
        .await?;

        let free = free_blocks(&parents, &allocated);
        let cidr = allocate_from_free_with(self.policy, request.mask_length, &free)?;

        // creation is not idempotent, so it is not retried
        let subnet = self.network.create_subnet(vpc, request, cidr).await?;
        info!(
            vpc_id = %vpc.vpc_id,
            subnet_id = %subnet.id,
            cidr = %subnet.cidr,
            "subnet allocated"
        );
        Ok(subnet)
    }
}

impl std::fmt::Debug for SubnetAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetAllocator")
            .field("lock", &self.lock)
            .field("retry", &self.retry)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LockError;
    use crate::lock::{InMemoryLockBackend, LockBackend, LockConfig};
    use crate::testing::FakeVpcNetwork;
    use std::time::Duration;

    fn block(s: &str) -> AddressBlock {
        s.parse().unwrap()
    }

    fn vpc() -> VpcRef {
        VpcRef::new("tencentcloud", "ap-guangzhou", "vpc-1")
    }

    fn request(mask_length: u8) -> SubnetRequest {
        SubnetRequest {
            name: "workers".to_string(),
            zone: "ap-guangzhou-3".to_string(),
            mask_length,
        }
    }

    fn allocator(backend: Arc<dyn LockBackend>, network: Arc<FakeVpcNetwork>) -> SubnetAllocator {
        SubnetAllocator::new(
            DistributedLock::new(backend, LockConfig::default()),
            network,
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocate_subnet_registers_free_block() {
        let network = Arc::new(
            FakeVpcNetwork::new(vec![block("10.0.0.0/16")])
                .with_allocated(vec![block("10.0.1.0/24")]),
        );
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let subnet = allocator(backend, network.clone())
            .allocate_subnet(&vpc(), &request(24))
            .await
            .unwrap();

        assert_eq!(subnet.cidr, block("10.0.0.0/24"));
        assert_eq!(network.subnets(), vec![subnet]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_capacity_and_no_parents() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());

        let full = Arc::new(FakeVpcNetwork::new(vec![block("10.0.0.0/16")]));
        let err = allocator(backend.clone(), full)
            .allocate_subnet(&vpc(), &request(15))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterflowError::Cidr(CidrError::NoCapacity { mask_length: 15 })
        ));

        let empty = Arc::new(FakeVpcNetwork::new(vec![]));
        let err = allocator(backend, empty)
            .allocate_subnet(&vpc(), &request(24))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterflowError::Cidr(CidrError::NoParentBlocks)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_reads_are_retried() {
        let network = Arc::new(
            FakeVpcNetwork::new(vec![block("10.0.0.0/24")]).with_transient_read_failures(2),
        );
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let subnet = allocator(backend, network)
            .allocate_subnet(&vpc(), &request(26))
            .await
            .unwrap();
        assert_eq!(subnet.cidr, block("10.0.0.0/26"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_released_after_failure() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let network = Arc::new(FakeVpcNetwork::new(vec![block("10.0.0.0/24")]));
        let alloc = allocator(backend.clone(), network);

        assert!(alloc.allocate_subnet(&vpc(), &request(16)).await.is_err());
        assert_eq!(backend.holder(&vpc().lock_key()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_aborts_allocation() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let other = DistributedLock::new(backend.clone(), LockConfig::default());
        let _held = other.lock(&vpc().lock_key(), LockOptions::new()).await.unwrap();

        let network = Arc::new(FakeVpcNetwork::new(vec![block("10.0.0.0/16")]));
        let alloc = allocator(backend, network.clone()).with_lock_options(
            LockOptions::new().with_acquire_timeout(Duration::from_secs(1)),
        );
        let err = alloc.allocate_subnet(&vpc(), &request(24)).await.unwrap_err();

        assert!(matches!(
            err,
            ClusterflowError::Lock(LockError::AcquireTimeout { .. })
        ));
        assert!(network.subnets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_allocations_are_disjoint() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let network = Arc::new(
            FakeVpcNetwork::new(vec![block("10.0.0.0/20")])
                .with_write_delay(Duration::from_millis(100)),
        );

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let alloc = allocator(backend.clone(), network.clone());
                tokio::spawn(async move { alloc.allocate_subnet(&vpc(), &request(24)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let subnets = network.subnets();
        assert_eq!(subnets.len(), 6);
        for (i, a) in subnets.iter().enumerate() {
            for b in &subnets[i + 1..] {
                assert!(!a.cidr.overlaps(&b.cidr), "{} overlaps {}", a.cidr, b.cidr);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlocked_allocations_race() {
        let network = Arc::new(
            FakeVpcNetwork::new(vec![block("10.0.0.0/20")])
                .with_write_delay(Duration::from_millis(100)),
        );

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let network = network.clone();
                tokio::spawn(async move {
                    let parents = network.vpc_cidrs(&vpc()).await?;
                    let allocated = network.allocated_subnets(&vpc()).await?;
                    let cidr = allocate_from_free_with(
                        AllocationPolicy::BestFit,
                        24,
                        &free_blocks(&parents, &allocated),
                    )
                    .map_err(|e| ProviderError::fatal(e.to_string()))?;
                    network.create_subnet(&vpc(), &request(24), cidr).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // both read the same snapshot and picked the same block
        let subnets = network.subnets();
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[0].cidr, subnets[1].cidr);
    }
}
