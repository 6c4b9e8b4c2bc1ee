//! `TaskStore` trait — the store-of-record and sole synchronization point.
//!
//! Exclusivity is enforced by [`TaskStore::claim`], an atomic compare-and-swap
//! on the status column. Everything else is plain reads and writes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::{Task, TaskPatch, TaskStatus};

/// Backend-agnostic task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Returns its id.
    async fn insert(&self, task: &Task) -> Result<Uuid, DatabaseError>;

    /// Get a task by id.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Oldest task (by creation time) with the given status.
    async fn oldest_by_status(&self, status: TaskStatus) -> Result<Option<Task>, DatabaseError>;

    /// All tasks with the given status, oldest first.
    async fn all_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// Atomically move `id` from `expected` to `new`, applying `extra` in the
    /// same write.
    ///
    /// Returns `Ok(false)` when the row no longer had `expected` (someone else
    /// got there first). Illegal transitions are rejected before touching the row.
    async fn claim(
        &self,
        id: Uuid,
        expected: TaskStatus,
        new: TaskStatus,
        extra: TaskPatch,
    ) -> Result<bool, DatabaseError>;

    /// Unconditional update. Only for writes with a single owner, such as the
    /// executor finishing a task it claimed.
    async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<(), DatabaseError>;

    /// Most recently created task on a thread whose status is in `statuses`.
    async fn latest_for_thread(
        &self,
        thread_id: &str,
        statuses: &[TaskStatus],
    ) -> Result<Option<Task>, DatabaseError>;

    /// Most recently created tasks, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, DatabaseError>;

    /// Number of tasks with the given status.
    async fn count_by_status(&self, status: TaskStatus) -> Result<usize, DatabaseError>;
}
