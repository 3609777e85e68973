//! Bounded polling for asynchronous cloud state transitions.
//!
//! Every step that waits on a remote operation (cluster becoming ready,
//! node pool normalizing, instances draining) re-queries a describe API
//! until the resource reaches a terminal state. [`loop_do`] centralizes
//! that wait: the probe runs immediately and then every `interval` until
//! it reports [`Probe::Done`], fails, or the deadline passes.
//!
//! Interval and timeout are per call; there is no global polling state.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::errors::ClusterflowError;

/// What a probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<E> {
    /// Not there yet; probe again after the interval.
    Continue,
    /// The awaited state was reached.
    Done,
    /// The operation failed; stop polling.
    Failed(E),
}

/// Why a poll loop stopped without reaching `Done`.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The deadline passed before the probe reported `Done`.
    #[error("{name}: deadline exceeded after {elapsed:?} ({attempts} probes)")]
    DeadlineExceeded {
        /// Loop name, for messages.
        name: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Number of probe invocations.
        attempts: u32,
    },

    /// The loop was cancelled.
    #[error("{name}: cancelled: {reason}")]
    Cancelled {
        /// Loop name, for messages.
        name: String,
        /// Cancellation reason.
        reason: String,
    },

    /// The probe reported a failure.
    #[error("{0}")]
    Probe(E),
}

impl<E> PollError<E> {
    /// Returns true for a deadline expiry.
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

impl<E: Into<ClusterflowError>> From<PollError<E>> for ClusterflowError {
    fn from(err: PollError<E>) -> Self {
        match err {
            PollError::DeadlineExceeded { .. } => Self::Timeout(err.to_string_lossy()),
            PollError::Cancelled { name, reason } => Self::Cancelled(format!("{name}: {reason}")),
            PollError::Probe(e) => e.into(),
        }
    }
}

impl<E> PollError<E> {
    fn to_string_lossy(&self) -> String {
        match self {
            Self::DeadlineExceeded {
                name,
                elapsed,
                attempts,
            } => format!("{name}: deadline exceeded after {elapsed:?} ({attempts} probes)"),
            Self::Cancelled { name, reason } => format!("{name}: cancelled: {reason}"),
            Self::Probe(_) => "probe failed".to_string(),
        }
    }
}

/// Interval and timeout for one kind of wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Time between probes in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Overall deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    20 * 60 * 1000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl PollConfig {
    /// Creates a config from durations.
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Probe interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Overall deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Deadline and cancellation for one poll loop.
#[derive(Debug, Clone)]
pub struct PollContext {
    name: String,
    timeout: Duration,
    cancel: Option<Arc<CancellationToken>>,
}

impl PollContext {
    /// Creates a context that expires `timeout` after the loop starts.
    #[must_use]
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            cancel: None,
        }
    }

    /// Stops the loop when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Loop name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overall deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn cancel_reason(&self) -> Option<String> {
        self.cancel
            .as_ref()
            .filter(|t| t.is_cancelled())
            .map(|t| t.reason().unwrap_or_default())
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    fn cancelled_error<E>(&self) -> PollError<E> {
        PollError::Cancelled {
            name: self.name.clone(),
            reason: self.cancel_reason().unwrap_or_default(),
        }
    }
}

/// Runs `probe` immediately and then every `interval` until it reports
/// `Done` (returns `Ok`), reports `Failed` (returned at once), the context
/// deadline passes, or the context is cancelled.
///
/// The probe is never started after the deadline; a probe still in flight
/// when the deadline passes is dropped.
pub async fn loop_do<F, Fut, E>(
    ctx: &PollContext,
    interval: Duration,
    mut probe: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<E>>,
{
    let started = Instant::now();
    let deadline = started + ctx.timeout;
    let mut attempts = 0u32;

    let deadline_exceeded = |attempts: u32| PollError::DeadlineExceeded {
        name: ctx.name.clone(),
        elapsed: started.elapsed(),
        attempts,
    };

    loop {
        if ctx.cancel_reason().is_some() {
            return Err(ctx.cancelled_error());
        }
        if Instant::now() >= deadline {
            return Err(deadline_exceeded(attempts));
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(ctx.cancelled_error()),
            outcome = tokio::time::timeout_at(deadline, probe()) => outcome,
        };

        match outcome {
            Err(_) => return Err(deadline_exceeded(attempts)),
            Ok(Probe::Done) => {
                debug!(name = %ctx.name, attempts, "poll loop done");
                return Ok(());
            }
            Ok(Probe::Failed(e)) => return Err(PollError::Probe(e)),
            Ok(Probe::Continue) => {}
        }

        let next = (Instant::now() + interval).min(deadline);
        tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(ctx.cancelled_error()),
            () = tokio::time::sleep_until(next) => {}
        }
    }
}

/// Like [`loop_do`], but when the deadline passes the probe runs once more
/// without a deadline before the timeout is reported. Describe APIs can
/// lag the real completion; a `Done` from that last probe turns the
/// timeout into success.
pub async fn loop_do_with_last_check<F, Fut, E>(
    ctx: &PollContext,
    interval: Duration,
    mut probe: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<E>>,
{
    match loop_do(ctx, interval, &mut probe).await {
        Err(err) if err.is_deadline_exceeded() => {
            warn!(name = %ctx.name, error = %err.to_string_lossy(), "poll deadline exceeded, running last check");
            match probe().await {
                Probe::Done => Ok(()),
                Probe::Failed(e) => Err(PollError::Probe(e)),
                Probe::Continue => Err(err),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_on_third_probe() {
        let calls = counter();
        let c = calls.clone();
        let ctx = PollContext::new("cluster-ready", Duration::from_secs(60));

        let result: Result<(), PollError<String>> =
            loop_do(&ctx, Duration::from_secs(5), || {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 3 {
                        Probe::Done
                    } else {
                        Probe::Continue
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_is_returned_immediately() {
        let calls = counter();
        let c = calls.clone();
        let ctx = PollContext::new("nodepool", Duration::from_secs(60));

        let result = loop_do(&ctx, Duration::from_secs(5), || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Probe::Failed("instance terminated".to_string()) }
        })
        .await;

        assert!(matches!(result, Err(PollError::Probe(ref e)) if e == "instance terminated"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_and_no_probe_after_deadline() {
        let timeout = Duration::from_secs(10);
        let interval = Duration::from_secs(3);
        let ctx = PollContext::new("never-ready", timeout);
        let start = Instant::now();
        let probe_times = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let times = probe_times.clone();

        let result: Result<(), PollError<String>> = loop_do(&ctx, interval, || {
            times.lock().push(Instant::now());
            async { Probe::Continue }
        })
        .await;

        let elapsed = start.elapsed();
        assert!(matches!(result, Err(PollError::DeadlineExceeded { .. })));
        assert!(elapsed <= timeout + interval);
        for at in probe_times.lock().iter() {
            assert!(*at < start + timeout);
        }
        // t = 0, 3, 6, 9
        assert_eq!(probe_times.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_is_cut_at_deadline() {
        let ctx = PollContext::new("slow", Duration::from_secs(2));
        let start = Instant::now();

        let result: Result<(), PollError<String>> = loop_do(&ctx, Duration::from_secs(1), || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Probe::Done
        })
        .await;

        assert!(result.unwrap_err().is_deadline_exceeded());
        assert!(start.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_loop() {
        let token = Arc::new(CancellationToken::new());
        let ctx = PollContext::new("drain", Duration::from_secs(600)).with_cancellation(token.clone());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(7)).await;
                token.cancel("task aborted");
            })
        };

        let result: Result<(), PollError<String>> =
            loop_do(&ctx, Duration::from_secs(5), || async { Probe::Continue }).await;
        canceller.await.unwrap();

        match result {
            Err(PollError::Cancelled { reason, .. }) => assert_eq!(reason, "task aborted"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_check_rescues_lagging_describe() {
        let ctx = PollContext::new("network-mode", Duration::from_secs(10));
        let start = Instant::now();

        let result: Result<(), PollError<String>> =
            loop_do_with_last_check(&ctx, Duration::from_secs(4), || {
                let late = start.elapsed() >= Duration::from_secs(10);
                async move {
                    if late {
                        Probe::Done
                    } else {
                        Probe::Continue
                    }
                }
            })
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_check_still_times_out() {
        let ctx = PollContext::new("never", Duration::from_secs(5));
        let result: Result<(), PollError<String>> =
            loop_do_with_last_check(&ctx, Duration::from_secs(1), || async { Probe::Continue })
                .await;
        assert!(result.unwrap_err().is_deadline_exceeded());
    }

    #[test]
    fn test_poll_error_into_cluster_error() {
        let err: PollError<ClusterflowError> = PollError::DeadlineExceeded {
            name: "wait".to_string(),
            elapsed: Duration::from_secs(1),
            attempts: 2,
        };
        assert!(matches!(ClusterflowError::from(err), ClusterflowError::Timeout(_)));
    }

    #[test]
    fn test_poll_config_defaults() {
        let config: PollConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.timeout(), Duration::from_secs(1200));
    }
}
