//! Queue state persistence.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::status::{QueueSettings, QueueStats};
use crate::task::{epoch_secs, TaskId, TaskRecord, TaskStatus};

/// Full queue state as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub tasks: HashMap<TaskId, TaskRecord>,
    pub stats: QueueStats,
    pub settings: QueueSettings,
    #[serde(with = "epoch_secs")]
    pub save_time: DateTime<Utc>,
}

impl QueueSnapshot {
    /// Turn tasks that were running when the state was saved back into
    /// waiting ones. Returns how many were reset.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Waiting;
                task.progress = 0.0;
                task.start_time = None;
                recovered += 1;
            }
        }
        recovered
    }
}

/// Loosely typed form used on load so one bad entry does not sink the file.
#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    tasks: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    stats: serde_json::Value,
    #[serde(default)]
    settings: serde_json::Value,
    #[serde(default)]
    save_time: Option<f64>,
}

impl RawSnapshot {
    fn decode(self, source: &str, default_max_concurrent: usize) -> QueueSnapshot {
        let mut tasks = HashMap::with_capacity(self.tasks.len());
        for (key, value) in self.tasks {
            match serde_json::from_value::<TaskRecord>(value) {
                Ok(task) => {
                    if task.id.to_string() != key {
                        warn!(key = %key, task_id = %task.id, "Task key does not match its id, using id");
                    }
                    tasks.insert(task.id, task);
                }
                Err(e) => warn!(key = %key, "Skipping unreadable task in {}: {}", source, e),
            }
        }

        let stats = if self.stats.is_null() {
            QueueStats::default()
        } else {
            serde_json::from_value(self.stats).unwrap_or_else(|e| {
                warn!("Ignoring unreadable stats in {}: {}", source, e);
                QueueStats::default()
            })
        };

        let default_settings = QueueSettings {
            max_concurrent: default_max_concurrent,
            running: false,
            paused: false,
        };
        let settings = if self.settings.is_null() {
            default_settings
        } else {
            serde_json::from_value(self.settings).unwrap_or_else(|e| {
                warn!("Ignoring unreadable settings in {}: {}", source, e);
                default_settings
            })
        };

        let save_time = self
            .save_time
            .and_then(epoch_secs::from_secs)
            .unwrap_or_else(Utc::now);

        QueueSnapshot {
            tasks,
            stats,
            settings,
            save_time,
        }
    }
}

/// Decode a state document, skipping bad task entries.
pub fn decode_snapshot(
    json: &str,
    source: &str,
    default_max_concurrent: usize,
) -> QueueResult<QueueSnapshot> {
    let raw: RawSnapshot = serde_json::from_str(json)?;
    let mut snapshot = raw.decode(source, default_max_concurrent);
    let recovered = snapshot.recover_interrupted();
    if recovered > 0 {
        debug!(recovered, "Reset interrupted tasks to waiting");
    }
    Ok(snapshot)
}

/// Persistence for the whole queue state.
///
/// Calls happen while the controller holds its state lock, so
/// implementations are synchronous.
pub trait QueueStore: Send + Sync {
    /// Replace the stored state.
    fn save(&self, snapshot: &QueueSnapshot) -> QueueResult<()>;

    /// Load the stored state, `None` if nothing was saved yet.
    ///
    /// Tasks recorded as running come back as waiting.
    fn load(&self) -> QueueResult<Option<QueueSnapshot>>;
}

/// In-memory store for testing and ephemeral queues.
pub struct MemoryStore {
    document: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty memory store.
    pub fn new() -> Self {
        Self {
            document: Mutex::new(None),
            saves: AtomicUsize::new(0),
        }
    }

    /// Create a store pre-seeded with a snapshot.
    pub fn with_snapshot(snapshot: &QueueSnapshot) -> QueueResult<Self> {
        let store = Self::new();
        *store.document.lock() = Some(serde_json::to_string(snapshot)?);
        Ok(store)
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStore for MemoryStore {
    fn save(&self, snapshot: &QueueSnapshot) -> QueueResult<()> {
        let json = serde_json::to_string(snapshot)?;
        *self.document.lock() = Some(json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> QueueResult<Option<QueueSnapshot>> {
        let document = self.document.lock().clone();
        match document {
            Some(json) => Ok(Some(decode_snapshot(&json, "memory store", 0)?)),
            None => Ok(None),
        }
    }
}

/// Single JSON file store.
///
/// ```text
/// {
///   "tasks":    { "<id>": { ...task fields... } },
///   "stats":    { "total_tasks", "completed_tasks", ... },
///   "settings": { "max_concurrent", "running", "paused" },
///   "save_time": <epoch seconds>
/// }
/// ```
///
/// Writes go to `<file>.tmp` and are renamed over the target once synced.
pub struct JsonFileStore {
    path: PathBuf,
    default_max_concurrent: usize,
    lock: Option<StateLock>,
}

impl JsonFileStore {
    /// Create a store for `path`. Nothing is touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_max_concurrent: 4,
            lock: None,
        }
    }

    /// Take exclusive ownership of the state file for the store's lifetime.
    ///
    /// Fails with `StateLocked` while another store holds it.
    pub fn lock(mut self) -> QueueResult<Self> {
        if self.lock.is_none() {
            self.lock = Some(StateLock::acquire(&self.path)?);
        }
        Ok(self)
    }

    /// Whether this store owns the state file.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Concurrency limit assumed when the file has no settings block.
    pub fn with_default_max_concurrent(mut self, max: usize) -> Self {
        self.default_max_concurrent = max;
        self
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, ".tmp")
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Advisory lock on `<file>.lock`, released on drop.
///
/// The state file itself is replaced on every save, so the lock lives on a
/// sidecar that is never renamed.
struct StateLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl StateLock {
    fn acquire(state_file: &Path) -> QueueResult<Self> {
        if let Some(parent) = state_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let path = sibling(state_file, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        #[cfg(unix)]
        let file = {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    warn!(path = %state_file.display(), "Queue state is locked by another process");
                    return Err(QueueError::StateLocked(state_file.to_path_buf()));
                }
                Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
            }
        };

        debug!(path = %path.display(), "Acquired state lock");
        Ok(Self { path, _file: file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Released state lock");
    }
}

impl QueueStore for JsonFileStore {
    fn save(&self, snapshot: &QueueSnapshot) -> QueueResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.temp_path();

        let mut file = File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            fs::remove_file(&tmp_path).ok();
            return Err(e.into());
        }

        debug!(path = %self.path.display(), tasks = snapshot.tasks.len(), "Saved queue state");
        Ok(())
    }

    fn load(&self) -> QueueResult<Option<QueueSnapshot>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let source = self.path.display().to_string();
        let snapshot = decode_snapshot(&content, &source, self.default_max_concurrent)?;
        debug!(path = %source, tasks = snapshot.tasks.len(), "Loaded queue state");
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
