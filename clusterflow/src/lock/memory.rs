//! In-process lease backend.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{LockBackend, LockHandle};
use crate::errors::LockError;

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    holder: String,
    expires_at: Instant,
}

/// Lease table held in memory. Expired leases are taken over by the next
/// caller.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    leases: DashMap<String, Lease>,
}

impl InMemoryLockBackend {
    /// Creates an empty lease table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current holder of a live lease on `key`.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        self.leases
            .get(key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let now = Instant::now();
        let lease = Lease {
            token: uuid::Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(None);
                }
                tracing::warn!(
                    key,
                    previous_holder = %occupied.get().holder,
                    "taking over expired lease"
                );
                occupied.insert(lease.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease.clone());
            }
        }

        Ok(Some(LockHandle {
            key: key.to_string(),
            token: lease.token,
            holder: lease.holder,
            ttl,
            acquired_at: Utc::now(),
        }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let removed = self
            .leases
            .remove_if(&handle.key, |_, lease| lease.token == handle.token);
        match removed {
            Some(_) => Ok(()),
            None => Err(LockError::NotHeld {
                key: handle.key.clone(),
            }),
        }
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError> {
        let Some(mut lease) = self.leases.get_mut(&handle.key) else {
            return Ok(false);
        };
        let now = Instant::now();
        if lease.token != handle.token || lease.expires_at <= now {
            return Ok(false);
        }
        lease.expires_at = now + ttl;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_holder_is_refused() {
        let backend = InMemoryLockBackend::new();
        let ttl = Duration::from_secs(30);

        let first = backend.try_acquire("vpc-1", "a", ttl).await.unwrap();
        assert!(first.is_some());
        assert!(backend.try_acquire("vpc-1", "b", ttl).await.unwrap().is_none());
        assert_eq!(backend.holder("vpc-1").as_deref(), Some("a"));

        // other keys are independent
        assert!(backend.try_acquire("vpc-2", "b", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let backend = InMemoryLockBackend::new();
        let ttl = Duration::from_secs(30);

        let handle = backend.try_acquire("k", "a", ttl).await.unwrap().unwrap();
        backend.release(&handle).await.unwrap();
        assert!(backend.try_acquire("k", "b", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_taken_over() {
        let backend = InMemoryLockBackend::new();
        let stale = backend
            .try_acquire("k", "crashed", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = backend
            .try_acquire("k", "b", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // the crashed holder can no longer release or renew the new lease
        assert_eq!(
            backend.release(&stale).await,
            Err(LockError::NotHeld { key: "k".to_string() })
        );
        assert!(!backend.renew(&stale, Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let backend = InMemoryLockBackend::new();
        let handle = backend
            .try_acquire("k", "a", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend.renew(&handle, Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(backend
            .try_acquire("k", "b", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
    }
}
