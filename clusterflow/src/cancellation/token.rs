//! Cancellation token shared by the engine, handlers and poll loops.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Hook run once when a token is cancelled.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Pending {
    reason: Option<String>,
    hooks: Vec<CancelCallback>,
}

/// Stops in-flight waits and the remaining steps of running tasks.
///
/// Cancelling twice keeps the first reason.
#[derive(Default)]
pub struct CancellationToken {
    flag: AtomicBool,
    pending: Mutex<Pending>,
    wake: Notify,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels with `reason`, wakes every [`cancelled`](Self::cancelled)
    /// waiter and runs the registered hooks. A panicking hook is logged and
    /// does not stop the others.
    pub fn cancel(&self, reason: impl Into<String>) {
        let hooks = {
            let mut pending = self.pending.lock();
            if pending.reason.is_some() {
                return;
            }
            let reason = reason.into();
            debug!(%reason, "cancellation requested");
            pending.reason = Some(reason);
            self.flag.store(true, Ordering::SeqCst);
            std::mem::take(&mut pending.hooks)
        };
        self.wake.notify_waiters();
        for hook in &hooks {
            run_hook(hook);
        }
    }

    /// Registers `hook` to run on cancellation, or runs it now if the token
    /// is already cancelled.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        {
            let mut pending = self.pending.lock();
            if pending.reason.is_none() {
                pending.hooks.push(Box::new(hook));
                return;
            }
        }
        run_hook(&hook);
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The first cancellation reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.pending.lock().reason.clone()
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // register before checking, or a cancel in between is lost
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn run_hook(hook: &(dyn Fn() + Send + Sync)) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!("cancel hook panicked");
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_new_token_is_live() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel("operator aborted");
        token.cancel("shutdown");

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("operator aborted"));
    }

    #[test]
    fn test_hooks_run_once_even_after_cancel() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let before = runs.clone();
        token.on_cancel(move || {
            before.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel("a");
        token.cancel("b");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let after = runs.clone();
        token.on_cancel(move || {
            after.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panicking_hook_does_not_block_others() {
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        token.on_cancel(|| panic!("hook blew up"));
        let flag = ran.clone();
        token.on_cancel(move || flag.store(true, Ordering::SeqCst));

        token.cancel("stop");
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_is_ready_after_cancel() {
        let token = CancellationToken::new();
        token.cancel("done");
        token.cancelled().await;
    }
}
