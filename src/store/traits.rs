//! `TaskStore` trait, the single durable source of truth for task state.

use async_trait::async_trait;

use crate::error::TaskError;
use crate::tasks::{Task, TaskId, TaskPage, TaskSpec, TaskStatus, TaskTransition};

/// Backend-agnostic task persistence.
///
/// Every mutation is applied as one atomic statement: readers see a record
/// either before or after a transition, never in between.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Validate `spec`, then persist it as a new `queued` task.
    ///
    /// Nothing is written when validation fails.
    async fn create(&self, spec: TaskSpec) -> Result<Task, TaskError>;

    /// Get a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError>;

    /// Page through tasks, newest first.
    ///
    /// `limit` is clamped to `[1, max_list_limit]`. Concurrent inserts can
    /// shift pages; callers get a best-effort snapshot.
    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<TaskPage, TaskError>;

    /// Apply one transition.
    ///
    /// Fails with `NotFound` for an unknown id and `InvalidTransition` when
    /// the task's current status does not accept it (the record is untouched).
    async fn update(&self, id: TaskId, transition: TaskTransition) -> Result<(), TaskError>;

    /// Delete a task. Returns `false` if it did not exist.
    async fn delete(&self, id: TaskId) -> Result<bool, TaskError>;

    /// Fail every `queued`/`running` task left over from a previous process.
    ///
    /// Returns the number of tasks reconciled.
    async fn reconcile_on_startup(&self) -> Result<u64, TaskError>;

    /// Cheap round-trip used by the health endpoint.
    async fn ping(&self) -> Result<(), TaskError>;
}
