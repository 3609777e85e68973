//! Free space computation: parents minus allocated.

use super::block::{AddressBlock, MAX_PREFIX};

/// Returns the address space of `parents` not covered by `allocated`, as
/// maximal aligned blocks sorted by address.
///
/// Nested or duplicate parents count once. Allocated blocks may overlap,
/// repeat or sit outside every parent; they are treated as their union and
/// only the part inside a parent matters. A free block never straddles two
/// parents.
#[must_use]
pub fn free_blocks(parents: &[AddressBlock], allocated: &[AddressBlock]) -> Vec<AddressBlock> {
    let mut free = Vec::new();
    for parent in collapse(parents) {
        for (start, end) in subtract(parent, allocated) {
            decompose(start, end, &mut free);
        }
    }
    free
}

/// Sorts parents and drops any contained in another.
fn collapse(parents: &[AddressBlock]) -> Vec<AddressBlock> {
    let mut sorted = parents.to_vec();
    sorted.sort();
    let mut kept: Vec<AddressBlock> = Vec::with_capacity(sorted.len());
    for block in sorted {
        // a container sorts before everything it contains
        if kept.last().is_some_and(|last| last.contains(&block)) {
            continue;
        }
        kept.push(block);
    }
    kept
}

/// Inclusive address ranges of `parent` left after removing `allocated`.
fn subtract(parent: AddressBlock, allocated: &[AddressBlock]) -> Vec<(u64, u64)> {
    let mut taken: Vec<(u64, u64)> = allocated
        .iter()
        .filter(|block| parent.overlaps(block))
        .map(|block| {
            (
                u64::from(block.first().max(parent.first())),
                u64::from(block.last().min(parent.last())),
            )
        })
        .collect();
    taken.sort_unstable();

    let mut ranges = Vec::new();
    let mut cursor = u64::from(parent.first());
    let end = u64::from(parent.last());
    for (start, stop) in taken {
        if start > cursor {
            ranges.push((cursor, start - 1));
        }
        cursor = cursor.max(stop + 1);
    }
    if cursor <= end {
        ranges.push((cursor, end));
    }
    ranges
}

/// Splits an inclusive range into the fewest aligned blocks.
fn decompose(mut start: u64, end: u64, out: &mut Vec<AddressBlock>) {
    while start <= end {
        // largest block aligned at `start`
        let mut host_bits = if start == 0 {
            u32::from(MAX_PREFIX)
        } else {
            start.trailing_zeros().min(u32::from(MAX_PREFIX))
        };
        while (1u64 << host_bits) > end - start + 1 {
            host_bits -= 1;
        }
        let prefix = MAX_PREFIX - u8::try_from(host_bits).unwrap_or(MAX_PREFIX);
        #[allow(clippy::cast_possible_truncation)]
        out.push(AddressBlock::from_raw(start as u32, prefix));
        start += 1u64 << host_bits;
    }
}
