//! IPv4 block allocation for VPC subnets.
//!
//! Allocation is free-space driven: subtract the allocated blocks from the
//! VPC's parent blocks ([`free_blocks`]), then carve the requested size out
//! of one free block ([`allocate_from_free`]). [`SubnetAllocator`] runs the
//! read-compute-register sequence under the per-VPC lock.

mod allocate;
mod block;
mod free;
mod subnet;

pub use allocate::{allocate_cidrs, allocate_from_free, allocate_from_free_with, AllocationPolicy};
pub use block::{AddressBlock, MAX_PREFIX};
pub use free::free_blocks;
pub use subnet::{Subnet, SubnetAllocator, SubnetRequest, VpcNetworkProvider, VpcRef};
