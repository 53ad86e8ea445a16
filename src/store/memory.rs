//! In-memory task store.

use super::TaskStore;
use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskId, TaskStatus, TaskUpdate};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        // Ids are never reused: tasks are never removed, so the last key
        // is the high-water mark.
        let next = tasks.keys().next_back().map_or(1, |id| id.0 + 1);
        let now = Utc::now();
        let task = Task {
            id: TaskId(next),
            query: new.query,
            status: TaskStatus::Pending,
            result: None,
            owner: new.owner,
            created_at: now,
            updated_at: now,
        };
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_task(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if let Some(expected) = update.expected {
            if task.status != expected {
                return Err(Error::InvalidTransition {
                    from: task.status.to_string(),
                    to: update.status.to_string(),
                });
            }
        }
        task.status = update.status;
        task.result = update.result;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn list_tasks_for_owner(&self, owner: &str) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect())
    }
}
