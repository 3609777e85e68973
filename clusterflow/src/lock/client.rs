//! Lock client with blocking acquisition and scoped release.

use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{LockBackend, LockConfig, LockHandle, LockOptions};
use crate::errors::LockError;

/// Blocking front end over a [`LockBackend`].
///
/// Each client has its own holder identity, so two clients over the same
/// backend exclude each other like two processes would.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    holder: String,
    config: LockConfig,
}

impl DistributedLock {
    /// Creates a client with a fresh holder identity.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self {
            backend,
            holder: uuid::Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Sets the holder identity reported to the backend.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Returns the holder identity.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Returns the client defaults.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Blocks until the lease on `key` is acquired or the acquisition
    /// timeout elapses.
    pub async fn lock(&self, key: &str, options: LockOptions) -> Result<LockHandle, LockError> {
        let ttl = options.ttl.unwrap_or_else(|| self.config.ttl());
        let timeout = options
            .acquire_timeout
            .unwrap_or_else(|| self.config.acquire_timeout());
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(handle) = self.backend.try_acquire(key, &self.holder, ttl).await? {
                debug!(key, holder = %self.holder, "lock acquired");
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::AcquireTimeout {
                    key: key.to_string(),
                    waited_ms: u64::try_from(now.duration_since(started).as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
            let wake = (now + self.config.retry_interval()).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Releases a lease obtained from [`lock`](Self::lock).
    pub async fn unlock(&self, handle: &LockHandle) -> Result<(), LockError> {
        self.backend.release(handle).await?;
        debug!(key = %handle.key, holder = %self.holder, "lock released");
        Ok(())
    }

    /// Extends a held lease by its original TTL.
    pub async fn renew(&self, handle: &LockHandle) -> Result<bool, LockError> {
        self.backend.renew(handle, handle.ttl).await
    }

    /// Runs `f` while holding the lease on `key`.
    ///
    /// The lease is released whether `f` succeeds or fails. A failed
    /// release is logged; the lease then lapses at its TTL.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let handle = self.lock(key, options).await?;
        let result = f().await;
        if let Err(e) = self.unlock(&handle).await {
            warn!(key, error = %e, "failed to release lock");
        }
        result
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("holder", &self.holder)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn clients(n: usize) -> Vec<DistributedLock> {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        (0..n)
            .map(|i| {
                DistributedLock::new(backend.clone(), LockConfig::default())
                    .with_holder(format!("worker-{i}"))
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_is_mutually_exclusive() {
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = clients(4)
            .into_iter()
            .map(|client| {
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    client
                        .with_lock("cidr/vpc-1", LockOptions::new(), || async {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, LockError>(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let clients = clients(2);
        let _held = clients[0].lock("k", LockOptions::new()).await.unwrap();

        let err = clients[1]
            .lock(
                "k",
                LockOptions::new().with_acquire_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AcquireTimeout { ref key, .. } if key == "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lock_after_ttl() {
        let clients = clients(2);
        // holder never releases
        let _crashed = clients[0]
            .lock("k", LockOptions::new().with_ttl(Duration::from_secs(2)))
            .await
            .unwrap();

        let handle = clients[1]
            .lock(
                "k",
                LockOptions::new().with_acquire_timeout(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        assert_eq!(handle.holder, "worker-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_on_error() {
        let clients = clients(2);
        let result: Result<(), LockError> = clients[0]
            .with_lock("k", LockOptions::new(), || async {
                Err(LockError::Backend("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let handle = clients[1]
            .lock(
                "k",
                LockOptions::new().with_acquire_timeout(Duration::from_millis(1)),
            )
            .await;
        assert!(handle.is_ok());
    }
}
