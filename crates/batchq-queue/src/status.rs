//! Aggregate statistics, persisted settings and the status view.

use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// Aggregate processing statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Tasks ever admitted.
    pub total_tasks: u64,
    /// Runs that completed.
    pub completed_tasks: u64,
    /// Runs that failed.
    pub failed_tasks: u64,
    /// Seconds spent in completed and failed runs.
    pub total_processing_time: f64,
    /// `total_processing_time / completed_tasks`.
    pub average_processing_time: f64,
}

impl QueueStats {
    /// Account a finished run.
    pub(crate) fn record_run(&mut self, succeeded: bool, duration_secs: f64) {
        if succeeded {
            self.completed_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        self.total_processing_time += duration_secs;
        if self.completed_tasks > 0 {
            self.average_processing_time =
                self.total_processing_time / self.completed_tasks as f64;
        }
    }
}

/// Queue-wide settings carried in the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Concurrency limit.
    pub max_concurrent: usize,
    /// Dispatch loop started.
    #[serde(default)]
    pub running: bool,
    /// Dispatch loop paused.
    #[serde(default)]
    pub paused: bool,
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    /// Count one task.
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Waiting => self.waiting += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Count for one status.
    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Waiting => self.waiting,
            TaskStatus::Running => self.running,
            TaskStatus::Paused => self.paused,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    /// Sum over all statuses.
    pub fn total(&self) -> usize {
        self.waiting + self.running + self.paused + self.completed + self.failed + self.cancelled
    }
}

/// Point-in-time view of the queue for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub running: bool,
    pub paused: bool,
    pub max_concurrent: usize,
    /// Executions currently holding a slot.
    pub current_running: usize,
    pub waiting_tasks: usize,
    pub total_tasks: usize,
    pub status_counts: StatusCounts,
    pub statistics: QueueStats,
}
