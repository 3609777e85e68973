//! Named, TTL-bounded mutual exclusion.
//!
//! The lock serializes the read-modify-write that hands out address blocks
//! for a VPC: read the allocated subnets, compute a free block, register
//! the new subnet. Two workflows doing that concurrently on stale
//! snapshots would pick overlapping blocks.
//!
//! The backend is any lease service reachable by every process that may
//! allocate for the same VPC; [`InMemoryLockBackend`] covers a single
//! process and tests. The TTL bounds how long a crashed holder can block
//! others.

mod client;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::LockError;

pub use client::DistributedLock;
pub use memory::InMemoryLockBackend;

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Resource key the lease covers.
    pub key: String,
    /// Unique token of this lease; release compares it.
    pub token: String,
    /// Holder identity.
    pub holder: String,
    /// Lease duration.
    pub ttl: Duration,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
}

/// Lease backend.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Takes the lease on `key` if it is free or expired. Returns `None`
    /// when another holder owns a live lease.
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError>;

    /// Releases the lease if `handle` still owns it.
    ///
    /// Returns `LockError::NotHeld` when the lease expired and was taken
    /// over, or was already released.
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;

    /// Extends the lease. Returns false when `handle` no longer owns it.
    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError>;
}

/// Defaults for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease duration in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// How long `lock` keeps trying, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Pause between acquisition attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_ttl_ms() -> u64 {
    60_000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_retry_interval_ms() -> u64 {
    200
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl LockConfig {
    /// Lease duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Pause between attempts.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Per-call overrides for [`DistributedLock::lock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Lease duration.
    pub ttl: Option<Duration>,
    /// Acquisition timeout.
    pub acquire_timeout: Option<Duration>,
}

impl LockOptions {
    /// Uses the client defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lease duration.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the acquisition timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// Lock key for CIDR allocation in one VPC.
#[must_use]
pub fn cidr_lock_key(provider: &str, region: &str, vpc_id: &str) -> String {
    format!("cidr/{provider}/{region}/{vpc_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_lock_key() {
        assert_eq!(
            cidr_lock_key("tencentcloud", "ap-guangzhou", "vpc-1"),
            "cidr/tencentcloud/ap-guangzhou/vpc-1"
        );
    }

    #[test]
    fn test_lock_config_defaults() {
        let config: LockConfig = serde_json::from_str(r#"{"ttl_ms": 5000}"#).unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(5));
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_interval(), Duration::from_millis(200));
    }
}
