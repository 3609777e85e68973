//! Recording step handler.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::Step;
use crate::errors::ClusterflowError;
use crate::handlers::{StepContext, StepHandler};
use crate::task::TaskState;

/// A handler that counts its calls, optionally fails its first calls and
/// writes a fixed bus entry on success.
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    calls: AtomicUsize,
    failures_left: Mutex<u32>,
    writes: Vec<(String, String)>,
    seen: Mutex<Vec<Step>>,
}

impl RecordingHandler {
    /// Creates a handler for `name` that always succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
            failures_left: Mutex::new(0),
            writes: Vec::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fails the first `n` calls.
    #[must_use]
    pub fn failing_first(self, n: u32) -> Self {
        *self.failures_left.lock() = n;
        self
    }

    /// Writes `key = value` to the bus on every successful call.
    #[must_use]
    pub fn writing(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.writes.push((key.into(), value.into()));
        self
    }

    /// Number of calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Steps passed to each call.
    #[must_use]
    pub fn seen_steps(&self) -> Vec<Step> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl StepHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        state: &mut TaskState,
        step: &Step,
    ) -> Result<(), ClusterflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(step.clone());

        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(ClusterflowError::Handler(format!(
                    "{} failed on purpose",
                    self.name
                )));
            }
        }

        for (key, value) in &self.writes {
            state.params_mut().set(key.clone(), value.clone());
        }
        Ok(())
    }
}
