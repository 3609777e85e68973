//! Bounded retry for individual cloud calls.
//!
//! Wraps a fallible call against transient failures (throttling, network
//! blips). This is distinct from [`crate::polling`], which waits for remote
//! *state* to converge rather than re-issuing a failed *call*.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayPolicy {
    /// Same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// `initial * multiplier^n`, capped at `max`.
    Exponential {
        /// First delay in milliseconds.
        initial_ms: u64,
        /// Cap in milliseconds.
        max_ms: u64,
        /// Growth factor per retry.
        multiplier: f64,
        /// Scale each delay by a random factor in `[0.5, 1.5)`.
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 500,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl DelayPolicy {
    /// Delay before retry number `retry` (0 for the first retry).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
            } => {
                let exp = i32::try_from(retry).unwrap_or(i32::MAX);
                #[allow(clippy::cast_precision_loss)]
                let raw = (initial_ms as f64 * multiplier.powi(exp)).min(max_ms as f64);
                let scaled = if jitter {
                    raw * rand::thread_rng().gen_range(0.5..1.5)
                } else {
                    raw
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let nanos = (scaled.max(0.0) * 1_000_000.0) as u64;
                Duration::from_nanos(nanos)
            }
        }
    }
}

/// How often, and how patiently, to retry a call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of calls, including the first. Zero is treated as one.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay between calls.
    #[serde(default)]
    pub delay: DelayPolicy,
}

fn default_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay: DelayPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Retries with a fixed delay.
    #[must_use]
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay: DelayPolicy::Fixed {
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            },
        }
    }

    /// Retries with exponential backoff and jitter.
    #[must_use]
    pub fn exponential(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            delay: DelayPolicy::Exponential {
                initial_ms: u64::try_from(initial.as_millis()).unwrap_or(u64::MAX),
                max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }

    /// Calls once, never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

/// Calls `operation` until it succeeds or `policy.attempts` calls have
/// been made, returning the last error on exhaustion.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, name: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(policy, name, operation, |_| true).await
}

/// Like [`retry`], but errors for which `is_retryable` returns false are
/// returned immediately.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => {
                debug!(operation = name, attempt, error = %e, "error is not retryable");
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                warn!(operation = name, attempt, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay.delay_for(attempt - 1);
                warn!(
                    operation = name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.delay.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay.delay_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_without_jitter_is_capped() {
        let delay = DelayPolicy::Exponential {
            initial_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(delay.delay_for(0), Duration::from_millis(100));
        assert_eq!(delay.delay_for(1), Duration::from_millis(200));
        assert_eq!(delay.delay_for(2), Duration::from_millis(400));
        assert_eq!(delay.delay_for(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_jitter_bounds() {
        let delay = DelayPolicy::Exponential {
            initial_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..20 {
            let d = delay.delay_for(0);
            assert!(d >= Duration::from_millis(50) && d < Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let policy = RetryPolicy::default();
        let result: Result<i32, String> = retry(&policy, "describe", || async { Ok(42) }).await;
        tokio_test::assert_ok!(result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<&str, String> = retry(&policy, "create", || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("throttled #{n}"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), String> = retry(&policy, "delete", || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {n}")) }
        })
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), String> = retry_if(
            &policy,
            "create",
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("invalid instance type".to_string()) }
            },
            |e| e.contains("throttled"),
        )
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_calls_once() {
        let policy = RetryPolicy::fixed(0, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let _: Result<(), String> = retry(&policy, "op", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("x".to_string()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_serde() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"attempts":4,"delay":{"kind":"fixed","delay_ms":100}}"#)
                .unwrap();
        assert_eq!(policy, RetryPolicy::fixed(4, Duration::from_millis(100)));
    }
}
