//! Task persistence seam.
//!
//! The lifecycle tracker only needs create, find, update and an owner
//! listing. [`postgres::PgTaskStore`] is the production store;
//! [`memory::MemoryTaskStore`] backs tests and local runs.

pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::model::{NewTask, Task, TaskId, TaskUpdate};
use async_trait::async_trait;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `pending` task and assign its id.
    async fn create_task(&self, new: NewTask) -> Result<Task>;

    /// Fails with `Error::NotFound` for an unknown id.
    async fn find_task(&self, id: TaskId) -> Result<Task>;

    /// Apply `update` and refresh `updated_at`. Fails with `Error::NotFound`
    /// for an unknown id, and with `Error::InvalidTransition` when
    /// `update.expected` no longer matches the stored status.
    async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task>;

    /// Tasks submitted by `owner`, oldest first.
    async fn list_tasks_for_owner(&self, owner: &str) -> Result<Vec<Task>>;
}
