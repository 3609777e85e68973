//! Bounded fan-out over independent resources.
//!
//! Describing thousands of instances one by one is too slow, and firing
//! every call at once trips provider rate limits. [`fan_out`] keeps at most
//! `limit` calls in flight and gathers every result into a
//! [`BatchOutcome`].

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::task::BatchOutcome;

/// Runs `f` on every item with at most `limit` calls in flight.
///
/// Successes carry `f`'s output, failures carry the input item and the
/// error text. Both lists follow input order regardless of completion
/// order. A `limit` of zero is treated as one.
pub async fn fan_out<T, R, E, F, Fut>(limit: usize, items: Vec<T>, f: F) -> BatchOutcome<R, T>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Display,
{
    let total = items.len();
    let gate = Semaphore::new(limit.max(1));
    let accumulator: Mutex<BatchOutcome<(usize, R), (usize, T)>> = Mutex::new(BatchOutcome::new());

    let mut running: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let gate = &gate;
            let accumulator = &accumulator;
            let f = &f;
            async move {
                // the semaphore is never closed
                let _permit = gate.acquire().await.ok();
                match f(item.clone()).await {
                    Ok(value) => accumulator.lock().push_success((index, value)),
                    Err(e) => accumulator.lock().push_failure((index, item), e.to_string()),
                }
            }
        })
        .collect();
    while running.next().await.is_some() {}
    drop(running);

    let mut indexed = accumulator.into_inner();
    indexed.succeeded.sort_by_key(|(index, _)| *index);
    indexed.failed.sort_by_key(|((index, _), _)| *index);
    debug!(
        total,
        limit,
        failed = indexed.failed.len(),
        "fan-out finished"
    );

    BatchOutcome {
        succeeded: indexed.succeeded.into_iter().map(|(_, value)| value).collect(),
        failed: indexed
            .failed
            .into_iter()
            .map(|((_, item), cause)| (item, cause))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_limit() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let outcome = fan_out(4, (0..50).collect(), |i: u32| {
            let in_flight = &in_flight;
            let peak = &peak;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i * 2)
            }
        })
        .await;

        assert_eq!(outcome.succeeded.len(), 50);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_input_order() {
        // later items finish first
        let outcome = fan_out(10, (0..10u64).collect(), |i| async move {
            tokio::time::sleep(Duration::from_millis(100 - i * 10)).await;
            if i == 3 || i == 7 {
                Err(format!("instance {i} unreachable"))
            } else {
                Ok(format!("10.0.0.{i}"))
            }
        })
        .await;

        assert_eq!(
            outcome.succeeded,
            vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.4", "10.0.0.5", "10.0.0.6", "10.0.0.8", "10.0.0.9"]
        );
        assert_eq!(
            outcome.failed,
            vec![
                (3, "instance 3 unreachable".to_string()),
                (7, "instance 7 unreachable".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let outcome = fan_out(0, Vec::<String>::new(), |s| async move { Ok::<_, String>(s) }).await;
        assert_eq!(outcome.total(), 0);
    }
}
