//! Carving a block of a requested size out of free space.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use super::block::{AddressBlock, MAX_PREFIX};
use super::free::free_blocks;
use crate::errors::CidrError;

/// Which free block a request is carved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Smallest free block that fits, lowest address on ties. Keeps large
    /// blocks intact for large requests.
    #[default]
    BestFit,
    /// Lowest-addressed free block that fits.
    FirstFit,
}

/// Carves a `/mask_length` block from `free` using [`AllocationPolicy::BestFit`].
pub fn allocate_from_free(
    mask_length: u8,
    free: &[AddressBlock],
) -> Result<AddressBlock, CidrError> {
    allocate_from_free_with(AllocationPolicy::default(), mask_length, free)
}

/// Carves a `/mask_length` block from `free`.
///
/// The result is the lowest-addressed sub-block of the chosen free block.
/// A request is always served from one free block; fragments are never
/// combined, so this fails with [`CidrError::NoCapacity`] even when the
/// total free space would be enough.
pub fn allocate_from_free_with(
    policy: AllocationPolicy,
    mask_length: u8,
    free: &[AddressBlock],
) -> Result<AddressBlock, CidrError> {
    if mask_length > MAX_PREFIX {
        return Err(CidrError::InvalidMaskLength { mask_length });
    }

    let fitting = free.iter().filter(|block| block.prefix() <= mask_length);
    let chosen = match policy {
        AllocationPolicy::BestFit => fitting.min_by_key(|block| (Reverse(block.prefix()), block.first())),
        AllocationPolicy::FirstFit => fitting.min_by_key(|block| block.first()),
    };

    chosen
        .map(|block| AddressBlock::from_raw(block.first(), mask_length))
        .ok_or(CidrError::NoCapacity { mask_length })
}

/// Allocates one block per entry of `masks`, in order, each one counting as
/// allocated for the next.
pub fn allocate_cidrs(
    parents: &[AddressBlock],
    allocated: &[AddressBlock],
    masks: &[u8],
) -> Result<Vec<AddressBlock>, CidrError> {
    if parents.is_empty() {
        return Err(CidrError::NoParentBlocks);
    }

    let mut taken = allocated.to_vec();
    let mut result = Vec::with_capacity(masks.len());
    for &mask_length in masks {
        let free = free_blocks(parents, &taken);
        let block = allocate_from_free(mask_length, &free)?;
        taken.push(block);
        result.push(block);
    }
    Ok(result)
}
