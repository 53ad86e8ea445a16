//! Request lifecycle: pending on creation, completed once a result lands.
//!
//! The tracker owns no state of its own. Records live in the
//! [`TaskStore`]; in-flight work lives in the queue.

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::model::{Dispatch, NewTask, ResultPolicy, Task, TaskId, TaskStatus, TaskUpdate};
use crate::queue::QueueClient;
use crate::store::TaskStore;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{Instrument, info, warn};

/// Validate a status change, returning an error if disallowed.
fn validate_transition(from: TaskStatus, to: TaskStatus, policy: ResultPolicy) -> Result<()> {
    if from.can_transition_to(to, policy) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub struct Tracker<S: TaskStore, B: Broker> {
    store: Arc<S>,
    queue: Arc<QueueClient<B>>,
    policy: ResultPolicy,
}

impl<S: TaskStore, B: Broker> Clone for Tracker<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            policy: self.policy,
        }
    }
}

impl<S: TaskStore, B: Broker> Tracker<S, B> {
    pub fn new(store: Arc<S>, queue: Arc<QueueClient<B>>, policy: ResultPolicy) -> Self {
        Self {
            store,
            queue,
            policy,
        }
    }

    /// Record a new `pending` task without enqueueing it.
    pub async fn create(&self, new: NewTask) -> Result<Task> {
        new.validate()?;
        let task = self.store.create_task(new).await?;
        info!(task_id = %task.id, owner = %task.owner, "task created");
        Ok(task)
    }

    /// Create a task and enqueue it.
    ///
    /// If the enqueue fails the task stays `pending` in the store and the
    /// [`Error::EnqueueFailed`] propagates; it is never reported as
    /// dispatched.
    pub async fn submit(&self, new: NewTask) -> Result<Task> {
        let task = self.create(new).await?;
        match self.queue.enqueue(&task).await {
            Ok(()) => {
                metrics::tasks_submitted().add(1, &[KeyValue::new("result", "ok")]);
                info!(task_id = %task.id, owner = %task.owner, "task submitted");
                Ok(task)
            }
            Err(e) => {
                metrics::tasks_submitted().add(1, &[KeyValue::new("result", "error")]);
                warn!(task_id = %task.id, error = %e, "task left pending, enqueue failed");
                Err(e)
            }
        }
    }

    /// Hand the next queued task to a worker, if there is one.
    pub async fn fetch_next(&self) -> Result<Option<Dispatch>> {
        let dispatch = self.queue.dequeue_dispatch().await?;
        if let Some(ref d) = dispatch {
            let span = start_task_span(&d.message.id);
            record_state_transition(&span, "pending", "dequeued");
            info!(
                task_id = %d.message.id,
                delivery_count = d.delivery_count,
                "task fetched"
            );
        }
        Ok(dispatch)
    }

    /// Record `result` and mark the task `completed`.
    ///
    /// Unknown ids fail with [`Error::NotFound`]. A second result for a
    /// completed task replaces the first under [`ResultPolicy::Overwrite`]
    /// and is an [`Error::InvalidTransition`] under [`ResultPolicy::Reject`].
    pub async fn complete(&self, id: TaskId, result: impl Into<String>) -> Result<Task> {
        let result = result.into();
        let span = start_task_span(&id);
        async {
            let current = match self.store.find_task(id).await {
                Ok(task) => task,
                Err(e @ Error::NotFound(_)) => {
                    warn!(task_id = %id, "result submitted for unknown task");
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            validate_transition(current.status, TaskStatus::Completed, self.policy)?;
            if current.status == TaskStatus::Completed {
                info!(task_id = %id, "overwriting result of completed task");
            }

            // Under Reject the pending check is repeated inside the store
            // write, so racing completions keep exactly one result.
            let mut update = TaskUpdate::completed(result);
            if self.policy == ResultPolicy::Reject {
                update = update.only_from(TaskStatus::Pending);
            }
            let task = self.store.update_task(id, update).await?;

            record_state_transition(&span, &current.status.to_string(), "completed");
            metrics::task_state_transitions().add(
                1,
                &[
                    KeyValue::new("from", current.status.to_string()),
                    KeyValue::new("to", "completed"),
                ],
            );
            info!(task_id = %id, "result submitted");
            Ok(task)
        }
        .instrument(span.clone())
        .await
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.store.find_task(id).await
    }

    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<Task>> {
        self.store.list_tasks_for_owner(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_policy_refuses_second_result() {
        assert!(
            validate_transition(TaskStatus::Completed, TaskStatus::Completed, ResultPolicy::Reject)
                .is_err()
        );
        assert!(
            validate_transition(
                TaskStatus::Completed,
                TaskStatus::Completed,
                ResultPolicy::Overwrite
            )
            .is_ok()
        );
    }
}
