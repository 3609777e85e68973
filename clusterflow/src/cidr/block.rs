//! IPv4 address blocks in CIDR notation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::errors::CidrError;

/// Largest valid prefix length.
pub const MAX_PREFIX: u8 = 32;

/// A contiguous, aligned IPv4 range written as `a.b.c.d/n`.
///
/// The network address is always normalized: host bits are zero. Blocks
/// order by network address, then by prefix (larger block first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressBlock {
    network: u32,
    prefix: u8,
}

pub(crate) fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (MAX_PREFIX - prefix)
    }
}

impl AddressBlock {
    /// Creates a block, clearing host bits of `addr`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > MAX_PREFIX {
            return Err(CidrError::InvalidMaskLength {
                mask_length: prefix,
            });
        }
        Ok(Self::from_raw(u32::from(addr), prefix))
    }

    /// Builds a block from a raw address; `prefix` must be at most 32.
    pub(crate) fn from_raw(network: u32, prefix: u8) -> Self {
        debug_assert!(prefix <= MAX_PREFIX);
        Self {
            network: network & prefix_mask(prefix),
            prefix,
        }
    }

    /// Network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// First address as an integer.
    #[must_use]
    pub fn first(&self) -> u32 {
        self.network
    }

    /// Last address as an integer.
    #[must_use]
    pub fn last(&self) -> u32 {
        self.network | !prefix_mask(self.prefix)
    }

    /// Number of addresses in the block.
    #[must_use]
    pub fn size(&self) -> u64 {
        1u64 << (MAX_PREFIX - self.prefix)
    }

    /// Returns true if `other` lies entirely inside this block.
    #[must_use]
    pub fn contains(&self, other: &AddressBlock) -> bool {
        other.prefix >= self.prefix && other.network & prefix_mask(self.prefix) == self.network
    }

    /// Returns true if the blocks share at least one address.
    ///
    /// Aligned blocks either nest or are disjoint.
    #[must_use]
    pub fn overlaps(&self, other: &AddressBlock) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for AddressBlock {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CidrError::InvalidBlock(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl Serialize for AddressBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
