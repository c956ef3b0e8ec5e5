//! Bounded execution pool for job bodies.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::error::{JobError, QueueError, QueueResult};
use crate::job::{JobContext, JobRunner, ProgressReporter};
use crate::task::TaskRecord;

/// Identifies one submission of a task to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job body returned `Ok`.
    Succeeded,
    /// The job body returned an error or panicked.
    Failed(String),
    /// The job stopped because it was cancelled, or was aborted.
    Cancelled,
}

/// Cancellation handle for a submitted job.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: ExecutionId,
    token: CancellationToken,
}

impl ExecutionHandle {
    /// Execution ID.
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Request cooperative cancellation. Returns immediately.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Fixed-size pool running job bodies on the tokio runtime.
pub struct ExecutionPool {
    runtime: Handle,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    cancel_grace: Duration,
    next_execution: AtomicU64,
    total_processed: Arc<AtomicU64>,
}

impl ExecutionPool {
    /// Create a pool on the current tokio runtime.
    pub fn new(max_concurrent: usize, cancel_grace: Duration) -> QueueResult<Self> {
        let runtime = Handle::try_current().map_err(|e| QueueError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(runtime, max_concurrent, cancel_grace))
    }

    /// Create a pool on an explicit runtime.
    pub fn with_runtime(runtime: Handle, max_concurrent: usize, cancel_grace: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            runtime,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            cancel_grace,
            next_execution: AtomicU64::new(1),
            total_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of slots.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Slots not held by an execution.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots held by an execution.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.available_slots()
    }

    /// Executions that have finished, in any way.
    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::SeqCst)
    }

    /// Start `job` for `task` in a free slot.
    ///
    /// `on_complete` runs exactly once, after the slot has been released, so
    /// it may submit the next job. Returns `PoolFull` when no slot is free.
    pub fn submit<F>(
        &self,
        task: TaskRecord,
        job: Arc<dyn JobRunner>,
        progress: ProgressReporter,
        on_complete: F,
    ) -> QueueResult<ExecutionHandle>
    where
        F: FnOnce(ExecutionId, JobOutcome) + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| QueueError::PoolFull)?;

        let id = ExecutionId(self.next_execution.fetch_add(1, Ordering::SeqCst));
        let task_id = task.id;
        let token = CancellationToken::new();
        let ctx = JobContext::new(token.clone(), progress);

        let span = tracing::info_span!("execution", task_id = %task_id, execution = %id);
        debug!(task_id = %task_id, execution = %id, "Submitting job");

        let job_handle = self
            .runtime
            .spawn(async move { job.run(task, ctx).await }.instrument(span.clone()));

        let supervisor_token = token.clone();
        let grace = self.cancel_grace;
        let total_processed = self.total_processed.clone();
        self.runtime.spawn(
            async move {
                let outcome = supervise(job_handle, supervisor_token, grace).await;
                total_processed.fetch_add(1, Ordering::SeqCst);
                drop(permit);
                on_complete(id, outcome);
            }
            .instrument(span),
        );

        Ok(ExecutionHandle { id, token })
    }
}

/// Wait for the job, enforcing the grace period once cancellation is requested.
async fn supervise(
    mut job: JoinHandle<Result<(), JobError>>,
    token: CancellationToken,
    grace: Duration,
) -> JobOutcome {
    tokio::select! {
        joined = &mut job => outcome_of(joined),
        _ = token.cancelled() => {
            match tokio::time::timeout(grace, &mut job).await {
                Ok(joined) => outcome_of(joined),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "Job ignored cancellation, aborting");
                    job.abort();
                    JobOutcome::Cancelled
                }
            }
        }
    }
}

fn outcome_of(joined: Result<Result<(), JobError>, JoinError>) -> JobOutcome {
    match joined {
        Ok(Ok(())) => JobOutcome::Succeeded,
        Ok(Err(JobError::Cancelled)) => JobOutcome::Cancelled,
        Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
        Err(e) if e.is_panic() => {
            JobOutcome::Failed(format!("job panicked: {}", panic_message(e.into_panic())))
        }
        Err(_) => JobOutcome::Cancelled,
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
