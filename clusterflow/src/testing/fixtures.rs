//! Task and store fixtures.

use std::sync::Arc;

use crate::cidr::AddressBlock;
use crate::core::{Step, Task};
use crate::errors::{CidrError, TaskError};
use crate::task::{InMemoryTaskStore, TaskStore};

/// A task with steps `first` and `second`, in cluster `c-1` and node
/// group `ng-1`.
pub fn two_step_task(task_id: &str) -> Result<Task, TaskError> {
    Task::new(task_id, "test")
        .with_cluster("c-1")
        .with_node_group("ng-1")
        .with_step(Step::new("first", "test"))?
        .with_step(Step::new("second", "test"))
}

/// A store holding `tasks`.
pub async fn seeded_store(tasks: &[Task]) -> Result<Arc<InMemoryTaskStore>, TaskError> {
    let store = Arc::new(InMemoryTaskStore::new());
    for task in tasks {
        store.save_task(task).await?;
    }
    Ok(store)
}

/// Parses a list of CIDR strings.
pub fn blocks(list: &[&str]) -> Result<Vec<AddressBlock>, CidrError> {
    list.iter().map(|s| s.parse()).collect()
}
