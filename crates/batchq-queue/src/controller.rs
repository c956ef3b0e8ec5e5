//! Queue controller: admission, dispatch and lifecycle operations.
//!
//! All state lives behind one mutex. Every mutation runs through
//! [`Shared::mutate`], which refills free execution slots, saves the state
//! and, once the lock is released, delivers observer events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::callbacks::{CallbackDispatcher, QueueEvent, QueueObserver};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{JobRunner, ProgressReporter};
use crate::pool::{ExecutionHandle, ExecutionId, ExecutionPool, JobOutcome};
use crate::queue::PriorityOrdering;
use crate::status::{QueueSettings, QueueStats, QueueStatus, StatusCounts};
use crate::store::{JsonFileStore, MemoryStore, QueueSnapshot, QueueStore};
use crate::task::{now, TaskId, TaskPriority, TaskRecord, TaskStatus};

/// Everything guarded by the controller mutex.
struct QueueState {
    tasks: HashMap<TaskId, TaskRecord>,
    ordering: PriorityOrdering,
    /// Executions the controller still owns, by task.
    running: HashMap<TaskId, ExecutionHandle>,
    stats: QueueStats,
    started: bool,
    paused: bool,
    next_sequence: u64,
}

impl QueueState {
    fn is_dispatching(&self) -> bool {
        self.started && !self.paused
    }

    fn waiting_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Waiting)
            .count()
    }
}

/// Side effects collected while the lock is held.
#[derive(Default)]
struct Effects {
    events: Vec<QueueEvent>,
    persist: bool,
    dispatch: bool,
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    pool: ExecutionPool,
    store: Arc<dyn QueueStore>,
    job: Arc<dyn JobRunner>,
    callbacks: CallbackDispatcher,
    changed: Notify,
}

/// Owner-facing handle to a task queue.
///
/// Cloning is cheap; clones share the same queue. Must be constructed inside
/// a tokio runtime. Jobs still running when the last handle is dropped finish
/// on their own but their outcomes are discarded.
#[derive(Clone)]
pub struct QueueController {
    shared: Arc<Shared>,
}

impl QueueController {
    /// Create a controller persisting to `config.state_file`, or to memory
    /// when no state file is configured.
    ///
    /// A state file is owned by one controller at a time; a second one on the
    /// same path fails with `QueueError::StateLocked`.
    pub fn new(config: QueueConfig, job: Arc<dyn JobRunner>) -> QueueResult<Self> {
        let store: Arc<dyn QueueStore> = match &config.state_file {
            Some(path) => Arc::new(
                JsonFileStore::new(path)
                    .with_default_max_concurrent(config.max_concurrent)
                    .lock()?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, store, job)
    }

    /// Create a controller on an explicit store, restoring whatever it holds.
    pub fn with_store(
        config: QueueConfig,
        store: Arc<dyn QueueStore>,
        job: Arc<dyn JobRunner>,
    ) -> QueueResult<Self> {
        let snapshot = match store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to load queue state, starting empty: {}", e);
                None
            }
        };

        let mut max_concurrent = config.max_concurrent;
        let mut state = QueueState {
            tasks: HashMap::new(),
            ordering: PriorityOrdering::new(),
            running: HashMap::new(),
            stats: QueueStats::default(),
            started: false,
            paused: false,
            next_sequence: 1,
        };

        if let Some(snapshot) = snapshot {
            if snapshot.settings.max_concurrent > 0 {
                max_concurrent = snapshot.settings.max_concurrent;
            }
            state.next_sequence = snapshot
                .tasks
                .values()
                .map(|t| t.sequence)
                .max()
                .map_or(1, |s| s + 1);
            state.ordering.rebuild(snapshot.tasks.values());
            state.tasks = snapshot.tasks;
            state.stats = snapshot.stats;
            info!(
                tasks = state.tasks.len(),
                waiting = state.waiting_count(),
                max_concurrent,
                "Restored queue state"
            );
        }

        let pool = ExecutionPool::new(max_concurrent, config.cancel_grace())?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                pool,
                store,
                job,
                callbacks: CallbackDispatcher::new(),
                changed: Notify::new(),
            }),
        })
    }

    /// Effective concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.shared.pool.max_concurrent()
    }

    /// Register lifecycle hooks.
    pub fn register_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.shared.callbacks.register(observer);
    }

    /// Admit a new WAITING task.
    ///
    /// Fails only when the state cannot be saved, in which case the task is
    /// not kept.
    pub fn add_task(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        priority: TaskPriority,
        metadata: serde_json::Value,
    ) -> QueueResult<TaskId> {
        let task = self
            .prepare(name.into(), path.into(), priority)
            .with_metadata(metadata);
        let ids = self.shared.admit(vec![task])?;
        Ok(ids[0])
    }

    /// Admit one task per path, named after the path's final component.
    pub fn add_tasks<P: Into<PathBuf>>(
        &self,
        paths: impl IntoIterator<Item = P>,
        priority: TaskPriority,
    ) -> QueueResult<Vec<TaskId>> {
        let tasks: Vec<TaskRecord> = paths
            .into_iter()
            .map(|path| {
                let path = path.into();
                let name = display_name(&path);
                self.prepare(name, path, priority)
            })
            .collect();
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.admit(tasks)
    }

    fn prepare(&self, name: String, path: PathBuf, priority: TaskPriority) -> TaskRecord {
        let file_size = payload_size(&path);
        let mut task = TaskRecord::new(name, path)
            .with_priority(priority)
            .with_max_retries(self.shared.config.max_retries);
        task.file_size = file_size;
        task
    }

    /// Delete a task, cancelling it first if it is running.
    pub fn remove_task(&self, id: TaskId) -> bool {
        self.shared.mutate(|state, effects| {
            let Some(task) = state.tasks.remove(&id) else {
                return false;
            };
            if let Some(handle) = state.running.remove(&id) {
                handle.cancel();
                effects.dispatch = true;
            }
            info!(task_id = %id, name = %task.name, "Task removed");
            effects.persist = true;
            true
        })
    }

    /// Pause a WAITING or RUNNING task. A running job is cancelled.
    pub fn pause_task(&self, id: TaskId) -> bool {
        self.shared.mutate(|state, effects| {
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            let was_running = task.status == TaskStatus::Running;
            if let Err(e) = task.pause() {
                debug!(task_id = %id, "Pause rejected: {}", e);
                return false;
            }
            if was_running {
                if let Some(handle) = state.running.remove(&id) {
                    handle.cancel();
                }
                effects.dispatch = true;
            }
            info!(task_id = %id, "Task paused");
            effects.persist = true;
            true
        })
    }

    /// Move a PAUSED task back to WAITING.
    pub fn resume_task(&self, id: TaskId) -> bool {
        self.shared.mutate(|state, effects| {
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            if let Err(e) = task.resume() {
                debug!(task_id = %id, "Resume rejected: {}", e);
                return false;
            }
            state.ordering.push(task);
            info!(task_id = %id, "Task resumed");
            effects.persist = true;
            effects.dispatch = true;
            true
        })
    }

    /// Cancel a WAITING or RUNNING task for good.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.shared.mutate(|state, effects| {
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            let was_running = task.status == TaskStatus::Running;
            if let Err(e) = task.cancel() {
                debug!(task_id = %id, "Cancel rejected: {}", e);
                return false;
            }
            if was_running {
                if let Some(handle) = state.running.remove(&id) {
                    handle.cancel();
                }
                effects.dispatch = true;
            }
            info!(task_id = %id, "Task cancelled");
            effects.persist = true;
            true
        })
    }

    /// Requeue a FAILED task that has retries left.
    pub fn retry_task(&self, id: TaskId) -> bool {
        self.shared.mutate(|state, effects| {
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            match task.retry() {
                Ok(()) => {
                    state.ordering.push(task);
                    info!(task_id = %id, retry = task.retry_count, "Task requeued for retry");
                    effects.persist = true;
                    effects.dispatch = true;
                    true
                }
                Err(QueueError::RetryLimitReached {
                    retries,
                    max_retries,
                }) => {
                    warn!(task_id = %id, retries, max_retries, "Retry limit reached");
                    false
                }
                Err(e) => {
                    debug!(task_id = %id, "Retry rejected: {}", e);
                    false
                }
            }
        })
    }

    /// Change the priority of a WAITING task.
    pub fn set_priority(&self, id: TaskId, priority: TaskPriority) -> bool {
        self.shared.mutate(|state, effects| {
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            if task.status != TaskStatus::Waiting {
                return false;
            }
            task.priority = priority;
            state.ordering.rebuild(state.tasks.values());
            info!(task_id = %id, priority = %priority, "Task priority changed");
            effects.persist = true;
            true
        })
    }

    /// Start dispatching.
    pub fn start(&self) {
        self.shared.mutate(|state, effects| {
            if state.started {
                return;
            }
            state.started = true;
            state.paused = false;
            info!(max_concurrent = self.shared.pool.max_concurrent(), "Queue started");
            effects.persist = true;
            effects.dispatch = true;
        })
    }

    /// Stop dispatching, cancel running jobs and put their tasks back to WAITING.
    pub fn stop(&self) {
        self.shared.mutate(|state, effects| {
            if !state.started {
                return;
            }
            state.started = false;
            let interrupted: Vec<(TaskId, ExecutionHandle)> = state.running.drain().collect();
            for (id, handle) in &interrupted {
                handle.cancel();
                if let Some(task) = state.tasks.get_mut(id) {
                    if task.requeue().is_ok() {
                        state.ordering.push(task);
                    }
                }
            }
            info!(interrupted = interrupted.len(), "Queue stopped");
            effects.persist = true;
        })
    }

    /// Stop dispatching new tasks; running ones continue.
    pub fn pause(&self) {
        self.shared.mutate(|state, effects| {
            state.paused = true;
            info!("Queue paused");
            effects.persist = true;
        })
    }

    /// Resume dispatching, starting the queue if it was stopped.
    pub fn resume(&self) {
        self.shared.mutate(|state, effects| {
            state.started = true;
            state.paused = false;
            info!("Queue resumed");
            effects.persist = true;
            effects.dispatch = true;
        })
    }

    /// Current queue status.
    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        let mut counts = StatusCounts::default();
        for task in state.tasks.values() {
            counts.add(task.status);
        }
        QueueStatus {
            running: state.started,
            paused: state.paused,
            max_concurrent: self.shared.pool.max_concurrent(),
            current_running: state.running.len(),
            waiting_tasks: counts.waiting,
            total_tasks: state.tasks.len(),
            status_counts: counts,
            statistics: state.stats.clone(),
        }
    }

    /// Delete every COMPLETED task. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        self.clear_status(TaskStatus::Completed)
    }

    /// Delete every FAILED task. Returns how many were removed.
    pub fn clear_failed(&self) -> usize {
        self.clear_status(TaskStatus::Failed)
    }

    fn clear_status(&self, status: TaskStatus) -> usize {
        self.shared.mutate(|state, effects| {
            let before = state.tasks.len();
            state.tasks.retain(|_, t| t.status != status);
            let removed = before - state.tasks.len();
            if removed > 0 {
                info!(removed, status = %status, "Cleared tasks");
                effects.persist = true;
            }
            removed
        })
    }

    /// Snapshot of one task.
    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.shared.state.lock().tasks.get(&id).cloned()
    }

    /// Snapshot of every task, in admission order.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.shared.state.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Snapshot of the tasks in `status`, in admission order.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .shared
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Whether there is nothing left to do for now: no execution holds a slot
    /// and no WAITING task would be dispatched.
    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Wait until [`is_idle`](Self::is_idle) holds. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        shared.wait_until(timeout, || shared.is_idle()).await
    }

    /// Stop the queue, wait for in-flight executions to give back their
    /// slots, and save.
    pub async fn shutdown(&self) {
        self.stop();
        let shared = &self.shared;
        let budget = shared.config.cancel_grace() + Duration::from_secs(1);
        if !shared.wait_until(budget, || shared.pool.active() == 0).await {
            warn!(active = shared.pool.active(), "Executions still active at shutdown");
        }
        let state = shared.state.lock();
        if let Err(e) = shared.save(&state) {
            error!("Failed to save queue state at shutdown: {}", e);
        }
        info!(tasks = state.tasks.len(), "Queue shut down");
    }
}

impl Shared {
    /// Run `f` under the lock, then dispatch, save and deliver events.
    fn mutate<R>(self: &Arc<Self>, f: impl FnOnce(&mut QueueState, &mut Effects) -> R) -> R {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let result = f(&mut state, &mut effects);
            if effects.dispatch {
                self.dispatch(&mut state, &mut effects);
            }
            if effects.persist {
                if let Err(e) = self.save(&state) {
                    error!("Failed to save queue state: {}", e);
                }
            }
            result
        };
        self.callbacks.dispatch(effects.events);
        self.changed.notify_waiters();
        result
    }

    fn admit(self: &Arc<Self>, mut tasks: Vec<TaskRecord>) -> QueueResult<Vec<TaskId>> {
        self.mutate(|state, effects| {
            let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
            for task in tasks.iter_mut() {
                task.sequence = state.next_sequence;
                state.next_sequence += 1;
            }
            for task in tasks {
                state.ordering.push(&task);
                state.tasks.insert(task.id, task);
            }
            state.stats.total_tasks += ids.len() as u64;

            if let Err(e) = self.save(state) {
                error!("Failed to save queue state, rejecting {} task(s): {}", ids.len(), e);
                for id in &ids {
                    state.tasks.remove(id);
                }
                state.stats.total_tasks -= ids.len() as u64;
                return Err(e);
            }

            for id in &ids {
                if let Some(task) = state.tasks.get(id) {
                    info!(task_id = %id, name = %task.name, priority = %task.priority, "Task added");
                }
            }
            effects.dispatch = true;
            Ok(ids)
        })
    }

    /// Fill free slots with the best WAITING tasks.
    fn dispatch(self: &Arc<Self>, state: &mut QueueState, effects: &mut Effects) {
        if !state.is_dispatching() {
            return;
        }
        while state.running.len() < self.pool.max_concurrent() {
            let Some(id) = state.ordering.pop_highest(&state.tasks) else {
                break;
            };
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            if let Err(e) = task.mark_running() {
                debug!(task_id = %id, "Skipping task: {}", e);
                continue;
            }

            let weak = Arc::downgrade(self);
            let submitted = self.pool.submit(
                task.clone(),
                self.job.clone(),
                self.progress_reporter(id),
                move |execution, outcome| {
                    if let Some(shared) = weak.upgrade() {
                        shared.complete(id, execution, outcome);
                    }
                },
            );

            match submitted {
                Ok(handle) => {
                    debug!(task_id = %id, execution = %handle.id(), "Task dispatched");
                    info!(task_id = %id, name = %task.name, "Task started");
                    effects.events.push(QueueEvent::Started(task.clone()));
                    state.running.insert(id, handle);
                    effects.persist = true;
                }
                Err(e) => {
                    // A cancelled execution still owns the slot; its completion re-triggers us.
                    debug!(task_id = %id, "Dispatch deferred: {}", e);
                    if task.requeue().is_ok() {
                        state.ordering.push(task);
                    }
                    break;
                }
            }
        }
    }

    fn complete(self: &Arc<Self>, id: TaskId, execution: ExecutionId, outcome: JobOutcome) {
        self.mutate(|state, effects| {
            effects.dispatch = true;
            if state.running.get(&id).map(|h| h.id()) != Some(execution) {
                debug!(task_id = %id, execution = %execution, "Ignoring abandoned execution");
                return;
            }
            state.running.remove(&id);
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };

            let failure = match outcome {
                JobOutcome::Succeeded => None,
                JobOutcome::Failed(message) => Some(message),
                JobOutcome::Cancelled => Some("job cancelled itself".to_string()),
            };

            match failure {
                None => {
                    if task.mark_completed().is_err() {
                        return;
                    }
                    state.stats.record_run(true, task.actual_duration);
                    info!(
                        task_id = %id,
                        name = %task.name,
                        duration_secs = task.actual_duration,
                        "Task completed"
                    );
                    effects.events.push(QueueEvent::Completed(task.clone()));
                }
                Some(message) => {
                    if task.mark_failed(message.clone()).is_err() {
                        return;
                    }
                    state.stats.record_run(false, task.actual_duration);
                    error!(task_id = %id, name = %task.name, "Task failed: {}", message);
                    effects.events.push(QueueEvent::Failed(task.clone(), message));
                }
            }
            effects.persist = true;
        })
    }

    fn progress_reporter(self: &Arc<Self>, id: TaskId) -> ProgressReporter {
        let weak: Weak<Shared> = Arc::downgrade(self);
        ProgressReporter::new(move |percent| {
            if let Some(shared) = weak.upgrade() {
                shared.record_progress(id, percent);
            }
        })
    }

    fn record_progress(&self, id: TaskId, percent: f64) {
        let event = {
            let mut state = self.state.lock();
            match state.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Running => {
                    task.set_progress(percent);
                    QueueEvent::Progress(task.clone())
                }
                _ => return,
            }
        };
        self.callbacks.dispatch(vec![event]);
    }

    fn save(&self, state: &QueueState) -> QueueResult<()> {
        let snapshot = QueueSnapshot {
            tasks: state.tasks.clone(),
            stats: state.stats.clone(),
            settings: QueueSettings {
                max_concurrent: self.pool.max_concurrent(),
                running: state.started,
                paused: state.paused,
            },
            save_time: now(),
        };
        self.store.save(&snapshot)
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.running.is_empty()
            && self.pool.active() == 0
            && (!state.is_dispatching() || state.waiting_count() == 0)
    }

    async fn wait_until(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if condition() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return condition();
            }
        }
    }
}

/// Size of a file, or the total size of the files under a directory.
fn payload_size(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(meta) if meta.is_dir() => WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum(),
        _ => 0,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
