//! # batchq queue
//!
//! Priority task queue for long-running batch jobs.
//!
//! ## Features
//!
//! - Four priority levels, FIFO within a level
//! - Bounded concurrent execution on tokio with cooperative cancellation
//! - Per-task pause, resume, cancel and manual retry
//! - Whole-queue persistence to a JSON state file, surviving restarts
//! - Lifecycle hooks isolated from the queue's own state

pub mod callbacks;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod pool;
pub mod queue;
pub mod status;
pub mod store;
pub mod task;

pub use callbacks::{CallbackDispatcher, QueueEvent, QueueObserver};
pub use config::QueueConfig;
pub use controller::QueueController;
pub use error::{JobError, QueueError, QueueResult};
pub use job::{JobContext, JobRunner, ProgressReporter};
pub use pool::{ExecutionHandle, ExecutionId, ExecutionPool, JobOutcome};
pub use queue::PriorityOrdering;
pub use status::{QueueSettings, QueueStats, QueueStatus, StatusCounts};
pub use store::{JsonFileStore, MemoryStore, QueueSnapshot, QueueStore};
pub use task::{TaskId, TaskPriority, TaskRecord, TaskStatus};
