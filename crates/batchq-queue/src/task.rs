//! Task definition, status and the transition table.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Task priority levels. Lower value runs first.
///
/// Persisted as the integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskPriority {
    /// Run before everything else.
    Urgent = 0,
    /// High priority.
    High = 1,
    /// Normal priority.
    Normal = 2,
    /// Low priority.
    Low = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskPriority::Urgent),
            1 => Ok(TaskPriority::High),
            2 => Ok(TaskPriority::Normal),
            3 => Ok(TaskPriority::Low),
            other => Err(format!("unknown priority value: {}", other)),
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "urgent" | "0" => Ok(TaskPriority::Urgent),
            "high" | "1" => Ok(TaskPriority::High),
            "normal" | "2" => Ok(TaskPriority::Normal),
            "low" | "3" => Ok(TaskPriority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in queue.
    Waiting,
    /// Currently being processed.
    Running,
    /// Held back by the user.
    Paused,
    /// Completed successfully.
    Completed,
    /// Failed (may be retried manually).
    Failed,
    /// Cancelled by user.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Waiting
    }
}

impl TaskStatus {
    /// All statuses in display order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Waiting,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// The transition table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Waiting, Paused)
                | (Waiting, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Waiting)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Waiting)
                | (Failed, Waiting)
        )
    }

    /// Lowercase name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status: {}", s))
    }
}

/// Current time at the precision the state file keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A task in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Job input, opaque to the scheduler.
    pub path: PathBuf,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Task priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Progress percentage in [0, 100].
    #[serde(default)]
    pub progress: f64,
    /// When the current or last run started.
    #[serde(default, with = "epoch_secs::option")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the task reached its latest terminal status.
    #[serde(default, with = "epoch_secs::option")]
    pub end_time: Option<DateTime<Utc>>,
    /// Failure message, only set while failed.
    #[serde(default, deserialize_with = "non_empty_string")]
    pub error_message: Option<String>,
    /// Manual retries used.
    #[serde(default)]
    pub retry_count: u32,
    /// Manual retries allowed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Admission time.
    #[serde(with = "epoch_secs")]
    pub created_time: DateTime<Utc>,
    /// Seconds between start and end of the last run.
    #[serde(default)]
    pub actual_duration: f64,
    /// Best-effort size of the payload in bytes.
    #[serde(default)]
    pub file_size: u64,
    /// Owner-supplied metadata, handed to the job body.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Admission order, breaks ties between equal creation times.
    #[serde(default)]
    pub sequence: u64,
}

impl TaskRecord {
    /// Create a new waiting task.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            path: path.into(),
            status: TaskStatus::Waiting,
            priority: TaskPriority::Normal,
            progress: 0.0,
            start_time: None,
            end_time: None,
            error_message: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            created_time: now(),
            actual_duration: 0.0,
            file_size: 0,
            metadata: serde_json::Value::Null,
            sequence: 0,
        }
    }

    /// Set task priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set maximum retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if task can be retried.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Move to `next` if the transition table allows it.
    fn transition_to(&mut self, next: TaskStatus) -> QueueResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
        self.actual_duration = self
            .start_time
            .map(|start| (at - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            .unwrap_or(0.0)
            .max(0.0);
    }

    /// WAITING -> RUNNING.
    pub fn mark_running(&mut self) -> QueueResult<()> {
        self.transition_to(TaskStatus::Running)?;
        self.start_time = Some(now());
        self.end_time = None;
        self.progress = 0.0;
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn mark_completed(&mut self) -> QueueResult<()> {
        self.transition_to(TaskStatus::Completed)?;
        self.progress = 100.0;
        self.finish(now());
        Ok(())
    }

    /// RUNNING -> FAILED.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> QueueResult<()> {
        self.transition_to(TaskStatus::Failed)?;
        self.error_message = Some(error.into());
        self.finish(now());
        Ok(())
    }

    /// RUNNING -> WAITING, forgetting the interrupted run.
    pub fn requeue(&mut self) -> QueueResult<()> {
        if self.status != TaskStatus::Running {
            return Err(QueueError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Waiting,
            });
        }
        self.transition_to(TaskStatus::Waiting)?;
        self.start_time = None;
        self.progress = 0.0;
        Ok(())
    }

    /// WAITING/RUNNING -> PAUSED.
    pub fn pause(&mut self) -> QueueResult<()> {
        let was_running = self.status == TaskStatus::Running;
        self.transition_to(TaskStatus::Paused)?;
        if was_running {
            self.start_time = None;
            self.progress = 0.0;
        }
        Ok(())
    }

    /// PAUSED -> WAITING.
    pub fn resume(&mut self) -> QueueResult<()> {
        if self.status != TaskStatus::Paused {
            return Err(QueueError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Waiting,
            });
        }
        self.transition_to(TaskStatus::Waiting)
    }

    /// WAITING/RUNNING -> CANCELLED.
    pub fn cancel(&mut self) -> QueueResult<()> {
        self.transition_to(TaskStatus::Cancelled)?;
        self.finish(now());
        Ok(())
    }

    /// FAILED -> WAITING, consuming one retry.
    pub fn retry(&mut self) -> QueueResult<()> {
        if self.status != TaskStatus::Failed {
            return Err(QueueError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Waiting,
            });
        }
        if self.retry_count >= self.max_retries {
            return Err(QueueError::RetryLimitReached {
                retries: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.transition_to(TaskStatus::Waiting)?;
        self.retry_count += 1;
        self.progress = 0.0;
        self.error_message = None;
        self.start_time = None;
        self.end_time = None;
        self.actual_duration = 0.0;
        Ok(())
    }

    /// Record progress, clamped to [0, 100].
    pub fn set_progress(&mut self, percent: f64) {
        if percent.is_nan() {
            return;
        }
        self.progress = percent.clamp(0.0, 100.0);
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Older state files wrote `""` for "no error".
fn non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// `DateTime<Utc>` as float epoch seconds.
pub(crate) mod epoch_secs {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn to_secs(time: &DateTime<Utc>) -> f64 {
        time.timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn from_secs(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
    }

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to_secs(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        from_secs(secs).ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", secs)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            time: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => serializer.serialize_some(&super::to_secs(t)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<f64>::deserialize(deserializer)? {
                Some(secs) => super::from_secs(secs)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", secs))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
