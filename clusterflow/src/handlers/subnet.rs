//! Subnet allocation step.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{step_params, StepContext, StepHandler};
use crate::cidr::{SubnetAllocator, SubnetRequest, VpcRef};
use crate::core::Step;
use crate::errors::ClusterflowError;
use crate::task::{CreateClusterParams, TaskState};

const DEFAULT_MASK_LENGTH: u8 = 24;

/// Allocates the cluster subnet inside the task's VPC.
///
/// Reads `vpcID`, `region` and `zone` from the bus and writes `subnetID`
/// and `subnetCIDR`. Does nothing if the bus already holds a subnet.
#[derive(Debug)]
pub struct AllocateSubnetHandler {
    allocator: Arc<SubnetAllocator>,
}

impl AllocateSubnetHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(allocator: Arc<SubnetAllocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl StepHandler for AllocateSubnetHandler {
    fn name(&self) -> &str {
        super::steps::ALLOCATE_SUBNET
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        state: &mut TaskState,
        step: &Step,
    ) -> Result<(), ClusterflowError> {
        let provider = state.task().provider.clone();
        let cluster_id = state.task().cluster_id.clone();
        let mut params = CreateClusterParams::new(state.params_mut());

        if let Some(subnet_id) = params.subnet_id() {
            info!(%subnet_id, "subnet already allocated, skipping");
            return Ok(());
        }

        let missing = |key: &str| ClusterflowError::Handler(format!("bus is missing '{key}'"));
        let vpc_id = params.vpc_id().ok_or_else(|| missing("vpcID"))?;
        let region = params.region().ok_or_else(|| missing("region"))?;
        let zone = params.zone().ok_or_else(|| missing("zone"))?;
        let mask_length = match step.param(step_params::MASK_LENGTH) {
            Some(raw) => raw.parse::<u8>().map_err(|_| {
                ClusterflowError::Handler(format!("invalid mask length '{raw}'"))
            })?,
            None => DEFAULT_MASK_LENGTH,
        };

        let vpc = VpcRef::new(provider, region, vpc_id);
        let request = SubnetRequest {
            name: format!("{cluster_id}-nodes"),
            zone,
            mask_length,
        };
        let subnet = self.allocator.allocate_subnet(&vpc, &request).await?;
        params.set_subnet(&subnet.id, &subnet.cidr.to_string());
        Ok(())
    }
}
