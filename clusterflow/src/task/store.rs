//! Task persistence.
//!
//! The store must give the calling process read-your-writes consistency:
//! a task saved with a step marked successful is never served back with
//! that step pending.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::Task;
use crate::errors::TaskError;

/// Storage backend for task records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Loads a task by id.
    async fn load_task(&self, task_id: &str) -> Result<Task, TaskError>;

    /// Persists the whole task record.
    async fn save_task(&self, task: &Task) -> Result<(), TaskError>;
}

/// In-memory task store.
///
/// Records are kept as serialized JSON, so a loaded task never aliases
/// state a caller is still mutating.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTaskStore {
    records: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn load_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let raw = self
            .records
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        serde_json::from_str(&raw).map_err(|e| TaskError::Serialization(e.to_string()))
    }

    async fn save_task(&self, task: &Task) -> Result<(), TaskError> {
        let raw =
            serde_json::to_string(task).map_err(|e| TaskError::Serialization(e.to_string()))?;
        self.records.lock().insert(task.task_id.clone(), raw);
        Ok(())
    }
}
