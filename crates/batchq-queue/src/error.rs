//! Queue errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Requested status change is not allowed from the current status.
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Task has used up its manual retries.
    #[error("Retry limit reached ({retries}/{max_retries})")]
    RetryLimitReached { retries: u32, max_retries: u32 },

    /// Every execution slot is taken.
    #[error("Execution pool is full")]
    PoolFull,

    /// Another queue instance holds the state file.
    #[error("Queue state {} is in use by another process", .0.display())]
    StateLocked(PathBuf),

    /// The controller was built outside a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Filesystem error while persisting or loading queue state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue state could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistence failed for a reason other than I/O or encoding.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error returned by a job body.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The job stopped because cancellation was requested.
    #[error("Job was cancelled")]
    Cancelled,

    /// I/O failure inside the job.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Shorthand for a failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}
