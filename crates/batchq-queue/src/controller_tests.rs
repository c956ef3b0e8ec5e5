use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde_json::json;
use tempfile::TempDir;

use crate::error::JobError;
use crate::job::JobContext;

async fn succeed(_: TaskRecord, _: JobContext) -> Result<(), JobError> {
    Ok(())
}

async fn fail_bad(task: TaskRecord, _: JobContext) -> Result<(), JobError> {
    if task.name.starts_with("bad") {
        return Err(JobError::failed("unsupported codec"));
    }
    Ok(())
}

async fn always_fail(_: TaskRecord, _: JobContext) -> Result<(), JobError> {
    Err(JobError::failed("disk full"))
}

async fn explode(_: TaskRecord, _: JobContext) -> Result<(), JobError> {
    panic!("bad frame")
}

async fn slow(_: TaskRecord, ctx: JobContext) -> Result<(), JobError> {
    for step in 1..=4 {
        ctx.check_cancelled()?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.report_progress(step as f64 * 25.0);
    }
    Ok(())
}

async fn until_cancelled(_: TaskRecord, ctx: JobContext) -> Result<(), JobError> {
    ctx.cancelled().await;
    Err(JobError::Cancelled)
}

async fn ignore_cancel(_: TaskRecord, _: JobContext) -> Result<(), JobError> {
    tokio::time::sleep(Duration::from_secs(60)).await;
    Ok(())
}

async fn quit_early(_: TaskRecord, _: JobContext) -> Result<(), JobError> {
    Err(JobError::Cancelled)
}

async fn finish_slowly(_: TaskRecord, _: JobContext) -> Result<(), JobError> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn half_done(_: TaskRecord, ctx: JobContext) -> Result<(), JobError> {
    ctx.report_progress(50.0);
    Ok(())
}

/// Ignores cancellation for a while and tracks how many bodies overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct Occupied<'a>(&'a AtomicUsize);

impl Drop for Occupied<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl JobRunner for Gauge {
    async fn run(&self, _task: TaskRecord, _ctx: JobContext) -> Result<(), JobError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _slot = Occupied(&self.current);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    events: parking_lot::Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn starts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
            .collect()
    }
}

impl QueueObserver for Recorder {
    fn on_task_start(&self, task: &TaskRecord) {
        self.events.lock().push(format!("start:{}", task.name));
    }

    fn on_task_complete(&self, task: &TaskRecord) {
        self.events.lock().push(format!("complete:{}", task.name));
    }

    fn on_task_failed(&self, task: &TaskRecord, error: &str) {
        self.events.lock().push(format!("failed:{}:{}", task.name, error));
    }

    fn on_progress_update(&self, task: &TaskRecord) {
        self.events.lock().push(format!("progress:{}:{}", task.name, task.progress));
    }
}

struct PanickingObserver;

impl QueueObserver for PanickingObserver {
    fn on_task_start(&self, _task: &TaskRecord) {
        panic!("observer bug");
    }
}

#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail: AtomicBool,
}

impl QueueStore for FlakyStore {
    fn save(&self, snapshot: &QueueSnapshot) -> QueueResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Persistence("disk full".to_string()));
        }
        self.inner.save(snapshot)
    }

    fn load(&self) -> QueueResult<Option<QueueSnapshot>> {
        self.inner.load()
    }
}

fn controller(max_concurrent: usize, job: Arc<dyn JobRunner>) -> QueueController {
    let config = QueueConfig::default()
        .with_max_concurrent(max_concurrent)
        .with_cancel_grace(Duration::from_millis(200));
    QueueController::new(config, job).unwrap()
}

fn add(queue: &QueueController, name: &str, priority: TaskPriority) -> TaskId {
    queue
        .add_task(name, format!("/data/{}", name), priority, serde_json::Value::Null)
        .unwrap()
}

async fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test]
fn test_requires_runtime() {
    let result = QueueController::new(QueueConfig::default(), Arc::new(succeed));
    assert!(matches!(result, Err(QueueError::NoRuntime(_))));
}

#[tokio::test]
async fn test_add_task_waits_until_started() {
    let queue = controller(2, Arc::new(succeed));
    let id = queue
        .add_task("clip", "/data/clip.mov", TaskPriority::High, json!({"preset": "fast"}))
        .unwrap();

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert_eq!(task.priority, TaskPriority::High);
    assert_eq!(task.max_retries, 3);
    assert_eq!(task.metadata["preset"], "fast");

    let status = queue.status();
    assert!(!status.running);
    assert_eq!(status.waiting_tasks, 1);
    assert_eq!(status.statistics.total_tasks, 1);
    assert!(queue.is_idle());
}

#[tokio::test]
async fn test_end_to_end_three_tasks() {
    let queue = controller(1, Arc::new(succeed));
    for name in ["a", "b", "c"] {
        add(&queue, name, TaskPriority::Normal);
    }

    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let status = queue.status();
    assert_eq!(status.status_counts.completed, 3);
    assert_eq!(status.current_running, 0);
    assert_eq!(status.statistics.completed_tasks, 3);
    for task in queue.tasks() {
        assert_eq!(task.progress, 100.0);
        assert!(task.end_time.is_some());
        assert!(task.actual_duration >= 0.0);
    }
}

#[tokio::test]
async fn test_priority_dispatch_order() {
    let queue = controller(1, Arc::new(succeed));
    let recorder = Arc::new(Recorder::default());
    queue.register_observer(recorder.clone());

    add(&queue, "low", TaskPriority::Low);
    add(&queue, "urgent-1", TaskPriority::Urgent);
    add(&queue, "normal", TaskPriority::Normal);
    add(&queue, "urgent-2", TaskPriority::Urgent);

    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(recorder.starts(), vec!["urgent-1", "urgent-2", "normal", "low"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_never_exceeds_limit() {
    let queue = controller(2, Arc::new(slow));
    for i in 0..8 {
        add(&queue, &format!("t{}", i), TaskPriority::Normal);
    }
    queue.start();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = queue.status();
        assert!(status.status_counts.running <= 2);
        assert!(status.current_running <= 2);
        assert_eq!(status.status_counts.total(), status.total_tasks);
        if status.status_counts.completed == 8 {
            break;
        }
        assert!(Instant::now() < deadline, "tasks did not finish");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_failure_is_isolated() {
    let queue = controller(1, Arc::new(fail_bad));
    let recorder = Arc::new(Recorder::default());
    queue.register_observer(recorder.clone());

    let bad = add(&queue, "bad", TaskPriority::Urgent);
    add(&queue, "good", TaskPriority::Normal);
    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let failed = queue.task(bad).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("unsupported codec"));
    assert!(recorder.events().contains(&"failed:bad:unsupported codec".to_string()));
    assert!(recorder.events().contains(&"complete:good".to_string()));

    let stats = queue.status().statistics;
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.failed_tasks, 1);
}

#[tokio::test]
async fn test_panicking_job_fails_task() {
    let queue = controller(1, Arc::new(explode));
    let id = add(&queue, "boom", TaskPriority::Normal);
    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("bad frame"));
}

#[tokio::test]
async fn test_job_cancelling_itself_fails_task() {
    let queue = controller(1, Arc::new(quit_early));
    let recorder = Arc::new(Recorder::default());
    queue.register_observer(recorder.clone());
    let id = add(&queue, "quitter", TaskPriority::Normal);

    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("job cancelled itself"));
    assert_eq!(queue.status().statistics.failed_tasks, 1);
    assert!(recorder
        .events()
        .contains(&"failed:quitter:job cancelled itself".to_string()));
}

#[tokio::test]
async fn test_retry_until_limit() {
    let config = QueueConfig {
        max_retries: 1,
        ..QueueConfig::default()
    };
    let queue = QueueController::new(config, Arc::new(always_fail)).unwrap();
    let id = add(&queue, "flaky", TaskPriority::Normal);
    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(queue.task(id).unwrap().status, TaskStatus::Failed);

    assert!(queue.retry_task(id));
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let before = queue.task(id).unwrap();
    assert_eq!(before.status, TaskStatus::Failed);
    assert_eq!(before.retry_count, 1);

    assert!(!queue.retry_task(id));
    assert_eq!(queue.task(id).unwrap(), before);
    assert_eq!(queue.status().statistics.failed_tasks, 2);
}

#[tokio::test]
async fn test_retry_resets_failed_task() {
    let queue = controller(1, Arc::new(always_fail));
    let id = add(&queue, "flaky", TaskPriority::Normal);
    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    queue.pause();
    assert!(queue.retry_task(id));
    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.progress, 0.0);
    assert!(task.error_message.is_none());
    assert!(!queue.retry_task(id));
}

#[tokio::test]
async fn test_set_priority() {
    let queue = controller(1, Arc::new(succeed));
    let recorder = Arc::new(Recorder::default());
    queue.register_observer(recorder.clone());

    add(&queue, "first", TaskPriority::Low);
    add(&queue, "second", TaskPriority::Low);
    let third = add(&queue, "third", TaskPriority::Low);

    assert!(queue.set_priority(third, TaskPriority::Urgent));
    assert!(!queue.set_priority(TaskId::new(), TaskPriority::High));

    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(recorder.starts(), vec!["third", "first", "second"]);

    assert!(!queue.set_priority(third, TaskPriority::Low));
}

#[tokio::test]
async fn test_clear_completed_and_failed() {
    let queue = controller(2, Arc::new(fail_bad));
    add(&queue, "ok-1", TaskPriority::Normal);
    add(&queue, "ok-2", TaskPriority::Normal);
    add(&queue, "bad-1", TaskPriority::Normal);
    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    queue.pause();
    let waiting = add(&queue, "later", TaskPriority::Normal);

    assert_eq!(queue.clear_completed(), 2);
    assert_eq!(queue.clear_completed(), 0);
    assert_eq!(queue.tasks().len(), 2);
    assert_eq!(queue.clear_failed(), 1);
    assert_eq!(queue.tasks().len(), 1);
    assert!(queue.task(waiting).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_requeues_running_tasks() {
    let queue = controller(2, Arc::new(until_cancelled));
    queue.register_observer(Arc::new(PanickingObserver));
    for name in ["a", "b", "c"] {
        add(&queue, name, TaskPriority::Normal);
    }

    queue.start();
    eventually(|| queue.status().status_counts.running == 2).await;

    queue.stop();
    let status = queue.status();
    assert!(!status.running);
    assert_eq!(status.status_counts.running, 0);
    assert_eq!(status.status_counts.waiting, 3);
    for task in queue.tasks() {
        assert_eq!(task.progress, 0.0);
        assert!(task.start_time.is_none());
    }

    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(queue.tasks_by_status(TaskStatus::Waiting).len(), 3);
    assert_eq!(queue.status().statistics.failed_tasks, 0);

    queue.resume();
    eventually(|| queue.status().status_counts.running == 2).await;
    queue.shutdown().await;
    assert_eq!(queue.status().status_counts.waiting, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_defers_dispatch_while_slot_is_held() {
    let queue = controller(1, Arc::new(finish_slowly));
    let first = add(&queue, "first", TaskPriority::High);
    let second = add(&queue, "second", TaskPriority::Normal);

    queue.start();
    eventually(|| queue.task(first).unwrap().status == TaskStatus::Running).await;
    queue.stop();
    assert_eq!(queue.shared.pool.active(), 1);

    // The stopped run still owns the only slot, so nothing can start yet.
    queue.start();
    let status = queue.status();
    assert_eq!(status.current_running, 0);
    assert_eq!(queue.task(first).unwrap().status, TaskStatus::Waiting);
    assert_eq!(queue.task(second).unwrap().status, TaskStatus::Waiting);

    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(queue.task(first).unwrap().status, TaskStatus::Completed);
    assert_eq!(queue.task(second).unwrap().status, TaskStatus::Completed);
    assert_eq!(queue.status().statistics.completed_tasks, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_start_churn_respects_limit() {
    let gauge = Arc::new(Gauge::default());
    let queue = controller(2, gauge.clone());
    for i in 0..6 {
        add(&queue, &format!("t{}", i), TaskPriority::Normal);
    }

    for round in 0..20 {
        queue.start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        if round % 2 == 0 {
            queue.pause();
            queue.resume();
        }
        assert!(queue.status().current_running <= 2);
        queue.stop();
    }

    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(queue.status().status_counts.completed, 6);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_and_resume_task() {
    let queue = controller(1, Arc::new(until_cancelled));
    let first = add(&queue, "first", TaskPriority::High);
    let second = add(&queue, "second", TaskPriority::Normal);
    queue.start();
    eventually(|| queue.task(first).unwrap().status == TaskStatus::Running).await;

    assert!(queue.pause_task(first));
    let paused = queue.task(first).unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.start_time.is_none());

    eventually(|| queue.task(second).unwrap().status == TaskStatus::Running).await;
    assert!(!queue.pause_task(first));
    assert!(queue.resume_task(first));
    assert_eq!(queue.task(first).unwrap().status, TaskStatus::Waiting);
    assert!(!queue.resume_task(first));

    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_task() {
    let queue = controller(1, Arc::new(until_cancelled));
    let running = add(&queue, "running", TaskPriority::Urgent);
    let waiting = add(&queue, "waiting", TaskPriority::Low);
    queue.start();
    eventually(|| queue.task(running).unwrap().status == TaskStatus::Running).await;

    assert!(queue.cancel_task(waiting));
    assert!(queue.cancel_task(running));
    assert!(!queue.cancel_task(running));

    let cancelled = queue.task(running).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.end_time.is_some());

    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(queue.status().status_counts.cancelled, 2);
    assert_eq!(queue.status().statistics.failed_tasks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uncooperative_job_is_aborted() {
    let config = QueueConfig::default()
        .with_max_concurrent(1)
        .with_cancel_grace(Duration::from_millis(50));
    let queue = QueueController::new(config, Arc::new(ignore_cancel)).unwrap();
    let id = add(&queue, "stubborn", TaskPriority::Normal);
    queue.start();
    eventually(|| queue.task(id).unwrap().status == TaskStatus::Running).await;

    assert!(queue.cancel_task(id));
    assert!(queue.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(queue.task(id).unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_task() {
    let queue = controller(1, Arc::new(until_cancelled));
    let id = add(&queue, "gone", TaskPriority::Normal);
    queue.start();
    eventually(|| queue.status().current_running == 1).await;

    assert!(queue.remove_task(id));
    assert!(!queue.remove_task(id));
    assert!(queue.task(id).is_none());
    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(queue.status().total_tasks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_pause_keeps_running_tasks() {
    let queue = controller(1, Arc::new(until_cancelled));
    let first = add(&queue, "first", TaskPriority::High);
    let second = add(&queue, "second", TaskPriority::Normal);
    queue.start();
    eventually(|| queue.task(first).unwrap().status == TaskStatus::Running).await;

    queue.pause();
    assert!(queue.status().paused);
    assert!(queue.cancel_task(first));
    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(queue.task(second).unwrap().status, TaskStatus::Waiting);

    queue.resume();
    eventually(|| queue.task(second).unwrap().status == TaskStatus::Running).await;
    queue.shutdown().await;
}

#[tokio::test]
async fn test_progress_reaches_observer() {
    let queue = controller(1, Arc::new(half_done));
    let recorder = Arc::new(Recorder::default());
    queue.register_observer(recorder.clone());
    let id = add(&queue, "p", TaskPriority::Normal);
    queue.start();
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(recorder.events(), vec!["start:p", "progress:p:50", "complete:p"]);
    assert_eq!(queue.task(id).unwrap().progress, 100.0);
}

#[tokio::test]
async fn test_add_task_rolls_back_when_save_fails() {
    let store = Arc::new(FlakyStore::default());
    let queue =
        QueueController::with_store(QueueConfig::default(), store.clone(), Arc::new(succeed))
            .unwrap();
    add(&queue, "kept", TaskPriority::Normal);

    store.fail.store(true, Ordering::SeqCst);
    let result = queue.add_task("lost", "/data/lost", TaskPriority::Normal, json!(null));
    assert!(matches!(result, Err(QueueError::Persistence(_))));
    assert_eq!(queue.tasks().len(), 1);
    assert_eq!(queue.status().statistics.total_tasks, 1);

    // Other operations keep going on in-memory state.
    let kept = queue.tasks()[0].id;
    assert!(queue.set_priority(kept, TaskPriority::Urgent));
}

#[tokio::test]
async fn test_every_mutation_is_saved() {
    let store = Arc::new(MemoryStore::new());
    let queue =
        QueueController::with_store(QueueConfig::default(), store.clone(), Arc::new(succeed))
            .unwrap();

    let id = add(&queue, "a", TaskPriority::Normal);
    assert_eq!(store.save_count(), 1);
    assert!(queue.set_priority(id, TaskPriority::High));
    assert_eq!(store.save_count(), 2);
    queue.pause();
    assert_eq!(store.save_count(), 3);

    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.tasks[&id].priority, TaskPriority::High);
    assert!(saved.settings.paused);
}

#[tokio::test]
async fn test_restore_from_store() {
    let mut running = TaskRecord::new("interrupted", "/data/a");
    running.sequence = 4;
    running.mark_running().unwrap();
    let mut done = TaskRecord::new("done", "/data/b");
    done.sequence = 9;
    done.mark_running().unwrap();
    done.mark_completed().unwrap();

    let snapshot = QueueSnapshot {
        tasks: [(running.id, running.clone()), (done.id, done.clone())]
            .into_iter()
            .collect(),
        stats: QueueStats {
            total_tasks: 2,
            completed_tasks: 1,
            ..Default::default()
        },
        settings: QueueSettings {
            max_concurrent: 7,
            running: true,
            paused: false,
        },
        save_time: now(),
    };
    let store = Arc::new(MemoryStore::with_snapshot(&snapshot).unwrap());

    let queue =
        QueueController::with_store(QueueConfig::default(), store, Arc::new(succeed)).unwrap();
    assert_eq!(queue.max_concurrent(), 7);

    let status = queue.status();
    assert!(!status.running);
    assert_eq!(status.status_counts.waiting, 1);
    assert_eq!(status.status_counts.completed, 1);
    assert_eq!(status.statistics.completed_tasks, 1);

    let restored = queue.task(running.id).unwrap();
    assert_eq!(restored.status, TaskStatus::Waiting);
    assert!(restored.start_time.is_none());

    let added = add(&queue, "new", TaskPriority::Normal);
    assert_eq!(queue.task(added).unwrap().sequence, 10);
}

#[tokio::test]
async fn test_add_tasks_names_and_sizes() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("movie.mkv");
    std::fs::write(&file, vec![0u8; 128]).unwrap();
    let folder = temp_dir.path().join("frames");
    std::fs::create_dir_all(folder.join("nested")).unwrap();
    std::fs::write(folder.join("a.png"), vec![0u8; 10]).unwrap();
    std::fs::write(folder.join("nested").join("b.png"), vec![0u8; 20]).unwrap();
    let missing = temp_dir.path().join("missing.wav");

    let queue = controller(1, Arc::new(succeed));
    let ids = queue
        .add_tasks(vec![file, folder, missing], TaskPriority::Low)
        .unwrap();
    assert_eq!(ids.len(), 3);

    let tasks = queue.tasks();
    let summary: Vec<(&str, u64)> = tasks.iter().map(|t| (t.name.as_str(), t.file_size)).collect();
    assert_eq!(summary, vec![("movie.mkv", 128), ("frames", 30), ("missing.wav", 0)]);
    assert!(tasks.iter().all(|t| t.priority == TaskPriority::Low));

    assert!(queue.add_tasks(Vec::<PathBuf>::new(), TaskPriority::Low).unwrap().is_empty());
}

#[tokio::test]
async fn test_wait_idle_times_out() {
    let queue = controller(1, Arc::new(until_cancelled));
    add(&queue, "forever", TaskPriority::Normal);
    queue.start();
    assert!(!queue.wait_idle(Duration::from_millis(50)).await);
    queue.shutdown().await;
    assert!(queue.is_idle());
}
