//! Task store with failure injection.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::core::Task;
use crate::errors::TaskError;
use crate::task::{InMemoryTaskStore, TaskStore};

/// In-memory store whose saves can be made to fail.
///
/// Simulates a process that crashes between doing a step's work and
/// recording it.
#[derive(Debug, Default)]
pub struct FlakyTaskStore {
    inner: InMemoryTaskStore,
    failing_saves: AtomicU32,
    saves: AtomicUsize,
}

impl FlakyTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` saves fail with `StoreUnavailable`.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Number of successful saves.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for FlakyTaskStore {
    async fn load_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.inner.load_task(task_id).await
    }

    async fn save_task(&self, task: &Task) -> Result<(), TaskError> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TaskError::StoreUnavailable("injected save failure".to_string()));
        }
        self.inner.save_task(task).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
