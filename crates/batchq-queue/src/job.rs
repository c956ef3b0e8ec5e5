//! Job body contract.
//!
//! The owner of the queue supplies a [`JobRunner`]; the queue calls it once
//! per dispatch with a snapshot of the task and a [`JobContext`] for
//! cancellation and progress.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::task::TaskRecord;

/// Executes the work behind a task.
///
/// Implementations should check [`JobContext::is_cancelled`] or await
/// [`JobContext::cancelled`] and return promptly once cancellation is
/// requested. A body that keeps running past the grace period is aborted at
/// its next await point.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job for `task`.
    async fn run(&self, task: TaskRecord, ctx: JobContext) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobRunner for F
where
    F: Fn(TaskRecord, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn run(&self, task: TaskRecord, ctx: JobContext) -> Result<(), JobError> {
        (self)(task, ctx).await
    }
}

/// Progress channel from a running job back to the queue.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(f64) + Send + Sync>,
}

impl ProgressReporter {
    /// Wrap a progress sink.
    pub fn new(sink: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A reporter that drops every update.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Report progress as a percentage in [0, 100].
    pub fn report(&self, percent: f64) {
        (self.sink)(percent);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Per-execution context handed to the job body.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    progress: ProgressReporter,
}

impl JobContext {
    pub fn new(token: CancellationToken, progress: ProgressReporter) -> Self {
        Self { token, progress }
    }

    /// The execution's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Report progress as a percentage in [0, 100].
    ///
    /// Reports made after cancellation was requested are dropped.
    pub fn report_progress(&self, percent: f64) {
        if self.token.is_cancelled() {
            return;
        }
        self.progress.report(percent);
    }

    /// Return `Err(JobError::Cancelled)` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}
