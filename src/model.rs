//! Core data model.
//!
//! A task is a query someone submitted. It has identity, an owner, a
//! lifecycle status, and (once completed) a result. The queue only ever
//! carries the `{id, query}` envelope; the store holds the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest query accepted at submission.
pub const MAX_QUERY_LEN: usize = 500;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A submitted request tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the store, never reused.
    pub id: TaskId,

    /// Opaque payload for the worker. Immutable after creation.
    pub query: String,

    pub status: TaskStatus,

    /// Present exactly when `status == Completed`.
    pub result: Option<String>,

    /// The submitting principal.
    pub owner: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The wire envelope published for this task.
    pub fn message(&self) -> QueueMessage {
        QueueMessage {
            id: self.id,
            query: self.query.clone(),
        }
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(TaskId)
            .map_err(|_| Error::Validation(format!("invalid task id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Persisted lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and (normally) enqueued, waiting for a result.
    Pending,
    /// A result has been submitted.
    Completed,
}

impl TaskStatus {
    /// Can a result be recorded moving from self to `to` under `policy`?
    pub fn can_transition_to(self, to: TaskStatus, policy: ResultPolicy) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Completed) => true,
            (Completed, Completed) => policy == ResultPolicy::Overwrite,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

/// What happens when a result arrives for an already-completed task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPolicy {
    /// Last write wins. Resubmission replaces the stored result.
    #[default]
    Overwrite,
    /// Resubmission is an invalid transition.
    Reject,
}

impl std::fmt::Display for ResultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultPolicy::Overwrite => write!(f, "overwrite"),
            ResultPolicy::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for ResultPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ResultPolicy::Overwrite),
            "reject" => Ok(ResultPolicy::Reject),
            other => Err(Error::Config(format!(
                "unknown result policy {other:?} (expected overwrite or reject)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// The `{id, query}` body carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: TaskId,
    pub query: String,
}

/// A task handed to a worker but not yet completed. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub message: QueueMessage,
    /// How many times the broker has handed this message out, this one
    /// included. Above 1 means an earlier delivery was never acknowledged.
    pub delivery_count: u32,
}

impl Dispatch {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) query: String,
    pub(crate) owner: String,
}

impl NewTask {
    pub fn new(query: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            owner: owner.into(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Reject empty or oversized queries and anonymous owners.
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }
        if self.query.chars().count() > MAX_QUERY_LEN {
            return Err(Error::Validation(format!(
                "query exceeds {MAX_QUERY_LEN} characters"
            )));
        }
        if self.owner.trim().is_empty() {
            return Err(Error::Validation("owner must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Fields changed by a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub result: Option<String>,
    /// Apply only while the stored status is this one. The check and the
    /// write are a single step in the store.
    pub expected: Option<TaskStatus>,
}

impl TaskUpdate {
    pub fn completed(result: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result.into()),
            expected: None,
        }
    }

    pub fn only_from(mut self, status: TaskStatus) -> Self {
        self.expected = Some(status);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let msg = QueueMessage {
            id: TaskId(1),
            query: "hello".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"id": 1, "query": "hello"}));
    }

    #[test]
    fn overwrite_policy_allows_completed_to_completed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Completed, ResultPolicy::Reject));
        assert!(
            TaskStatus::Completed.can_transition_to(TaskStatus::Completed, ResultPolicy::Overwrite)
        );
        assert!(
            !TaskStatus::Completed.can_transition_to(TaskStatus::Completed, ResultPolicy::Reject)
        );
        assert!(
            !TaskStatus::Completed.can_transition_to(TaskStatus::Pending, ResultPolicy::Overwrite)
        );
    }

    #[test]
    fn validate_rejects_blank_and_oversized_queries() {
        assert!(NewTask::new("   ", "alice").validate().is_err());
        assert!(NewTask::new("x".repeat(MAX_QUERY_LEN + 1), "alice").validate().is_err());
        assert!(NewTask::new("x".repeat(MAX_QUERY_LEN), "alice").validate().is_ok());
        assert!(NewTask::new("hello", "").validate().is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [TaskStatus::Pending, TaskStatus::Completed] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("dequeued".parse::<TaskStatus>().is_err());
    }
}
