//! Priority ordering over waiting tasks.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::task::{TaskId, TaskPriority, TaskRecord, TaskStatus};

/// Heap entry: a snapshot of the ordering key taken at push time.
#[derive(Debug, Clone)]
struct QueueEntry {
    priority: TaskPriority,
    created_time: DateTime<Utc>,
    sequence: u64,
    id: TaskId,
}

impl QueueEntry {
    fn of(task: &TaskRecord) -> Self {
        Self {
            priority: task.priority,
            created_time: task.created_time,
            sequence: task.sequence,
            id: task.id,
        }
    }

    /// The entry still describes a waiting task with the same key.
    fn is_current(&self, task: &TaskRecord) -> bool {
        task.status == TaskStatus::Waiting
            && task.priority == self.priority
            && task.created_time == self.created_time
            && task.sequence == self.sequence
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the smallest key must compare greatest.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_time.cmp(&self.created_time))
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Priority queue over waiting tasks.
///
/// Order is `(priority, created_time, sequence)` ascending. Entries are not
/// removed when a task leaves WAITING or changes priority; `pop_highest`
/// discards them lazily by checking the authoritative task map.
#[derive(Debug, Default)]
pub struct PriorityOrdering {
    heap: BinaryHeap<QueueEntry>,
}

impl PriorityOrdering {
    /// Create an empty ordering.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Push a task. Only waiting tasks are accepted.
    pub fn push(&mut self, task: &TaskRecord) {
        if task.status != TaskStatus::Waiting {
            return;
        }
        debug!(task_id = %task.id, priority = %task.priority, "Enqueueing task");
        self.heap.push(QueueEntry::of(task));
    }

    /// Pop the best waiting task, skipping stale entries.
    pub fn pop_highest(&mut self, tasks: &HashMap<TaskId, TaskRecord>) -> Option<TaskId> {
        while let Some(entry) = self.heap.pop() {
            match tasks.get(&entry.id) {
                Some(task) if entry.is_current(task) => {
                    debug!(task_id = %entry.id, "Dequeued task");
                    return Some(entry.id);
                }
                _ => debug!(task_id = %entry.id, "Discarding stale queue entry"),
            }
        }
        None
    }

    /// Re-heapify from the task map, dropping every stale entry.
    pub fn rebuild<'a>(&mut self, tasks: impl IntoIterator<Item = &'a TaskRecord>) {
        let entries: Vec<QueueEntry> = tasks
            .into_iter()
            .filter(|task| task.status == TaskStatus::Waiting)
            .map(QueueEntry::of)
            .collect();
        self.heap = BinaryHeap::from(entries);
        debug!(len = self.heap.len(), "Rebuilt priority ordering");
    }

    /// Number of entries, stale ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
