//! Lifecycle hooks and their failure-isolated delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::pool::panic_message;
use crate::task::TaskRecord;

/// Owner-supplied lifecycle hooks. Every method defaults to a no-op.
///
/// Hooks run on whichever thread caused the event, after the queue has
/// released its lock; calling back into the controller is allowed.
pub trait QueueObserver: Send + Sync {
    /// A task was dispatched.
    fn on_task_start(&self, _task: &TaskRecord) {}

    /// A task completed successfully.
    fn on_task_complete(&self, _task: &TaskRecord) {}

    /// A task failed.
    fn on_task_failed(&self, _task: &TaskRecord, _error: &str) {}

    /// A running task reported progress.
    fn on_progress_update(&self, _task: &TaskRecord) {}
}

/// Lifecycle event waiting to be delivered.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Started(TaskRecord),
    Completed(TaskRecord),
    Failed(TaskRecord, String),
    Progress(TaskRecord),
}

impl QueueEvent {
    fn name(&self) -> &'static str {
        match self {
            QueueEvent::Started(_) => "on_task_start",
            QueueEvent::Completed(_) => "on_task_complete",
            QueueEvent::Failed(..) => "on_task_failed",
            QueueEvent::Progress(_) => "on_progress_update",
        }
    }

    fn task(&self) -> &TaskRecord {
        match self {
            QueueEvent::Started(task)
            | QueueEvent::Completed(task)
            | QueueEvent::Failed(task, _)
            | QueueEvent::Progress(task) => task,
        }
    }
}

/// Delivers events to every registered observer.
#[derive(Default)]
pub struct CallbackDispatcher {
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn register(&self, observer: Arc<dyn QueueObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Check if no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Deliver events in order. A panicking hook is logged and skipped.
    pub fn dispatch(&self, events: Vec<QueueEvent>) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for event in &events {
            for observer in &observers {
                let result = catch_unwind(AssertUnwindSafe(|| match event {
                    QueueEvent::Started(task) => observer.on_task_start(task),
                    QueueEvent::Completed(task) => observer.on_task_complete(task),
                    QueueEvent::Failed(task, message) => observer.on_task_failed(task, message),
                    QueueEvent::Progress(task) => observer.on_progress_update(task),
                }));
                if let Err(payload) = result {
                    error!(
                        task_id = %event.task().id,
                        hook = event.name(),
                        "Callback panicked: {}",
                        panic_message(payload)
                    );
                }
            }
        }
    }
}
