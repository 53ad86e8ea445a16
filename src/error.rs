//! Error types for requestq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Broker unreachable or the session dropped. Retried, then escalated.
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("enqueue failed after {attempts} attempt(s): {reason}")]
    EnqueueFailed { attempts: u32, reason: String },

    #[error("dequeue failed after {attempts} attempt(s): {reason}")]
    DequeueFailed { attempts: u32, reason: String },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("validation error: {0}")]
    Validation(String),

    /// A queue message whose body is not a task envelope. Dead-lettered.
    #[error("malformed queue message {tag}: {reason}")]
    MalformedMessage { tag: i64, reason: String },

    /// Connecting failed on every attempt the retry budget allowed.
    #[error("broker unavailable after {attempts} connect attempt(s): {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a retry loop may try the operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
