//! Subcommand handlers for batchq.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use batchq_queue::{
    JobContext, JobError, JsonFileStore, QueueConfig, QueueController, QueueError, QueueObserver,
    QueueStore, TaskId, TaskRecord,
};

use crate::cli::{ClearTarget, Commands};
use crate::command_job::CommandJob;
use crate::config::Config;

/// Handle one subcommand against the configured state file.
pub(crate) async fn handle_command(command: Commands, config: Config) -> anyhow::Result<()> {
    let mut queue_config = config.queue;
    match command {
        Commands::Run {
            program,
            args,
            max_concurrent,
        } => {
            if let Some(max) = max_concurrent {
                override_max_concurrent(&mut queue_config, max)?;
            }
            run_queue(queue_config, CommandJob::new(program, args)).await
        }
        Commands::Add {
            paths,
            name,
            priority,
            max_retries,
        } => {
            if let Some(max) = max_retries {
                queue_config.max_retries = max;
            }
            let queue = open_queue(queue_config)?;
            let ids = match name {
                Some(name) if paths.len() == 1 => {
                    let path = paths.into_iter().next().context("no path given")?;
                    vec![queue.add_task(name, path, priority, serde_json::Value::Null)?]
                }
                Some(_) => bail!("--name can only be used with a single path"),
                None => queue.add_tasks(paths, priority)?,
            };
            for id in ids {
                println!("{}", id);
            }
            Ok(())
        }
        Commands::List { status, format } => {
            let queue = open_queue(queue_config)?;
            let tasks = match status {
                Some(status) => queue.tasks_by_status(status),
                None => queue.tasks(),
            };
            print_tasks(&tasks, &format)
        }
        Commands::Status => {
            let queue = open_queue(queue_config)?;
            println!("{}", serde_json::to_string_pretty(&queue.status())?);
            Ok(())
        }
        Commands::Pause { id } => {
            let queue = open_queue(queue_config)?;
            apply(&queue, id, "pause", |q| q.pause_task(id))
        }
        Commands::Resume { id } => {
            let queue = open_queue(queue_config)?;
            apply(&queue, id, "resume", |q| q.resume_task(id))
        }
        Commands::Cancel { id } => {
            let queue = open_queue(queue_config)?;
            apply(&queue, id, "cancel", |q| q.cancel_task(id))
        }
        Commands::Retry { id } => {
            let queue = open_queue(queue_config)?;
            apply(&queue, id, "retry", |q| q.retry_task(id))
        }
        Commands::Remove { id } => {
            let queue = open_queue(queue_config)?;
            apply(&queue, id, "remove", |q| q.remove_task(id))
        }
        Commands::Priority { id, level } => {
            let queue = open_queue(queue_config)?;
            apply(&queue, id, "reprioritize", |q| q.set_priority(id, level))
        }
        Commands::Clear { target } => {
            let queue = open_queue(queue_config)?;
            let removed = match target {
                ClearTarget::Completed => queue.clear_completed(),
                ClearTarget::Failed => queue.clear_failed(),
            };
            println!("Removed {} task(s)", removed);
            Ok(())
        }
    }
}

/// Job body for invocations that only edit the queue.
async fn not_runnable(_task: TaskRecord, _ctx: JobContext) -> Result<(), JobError> {
    Err(JobError::failed("queue opened without a job program"))
}

fn open_queue(config: QueueConfig) -> anyhow::Result<QueueController> {
    let queue = QueueController::new(config, Arc::new(not_runnable))?;
    Ok(queue)
}

fn apply(
    queue: &QueueController,
    id: TaskId,
    action: &str,
    op: impl FnOnce(&QueueController) -> bool,
) -> anyhow::Result<()> {
    let Some(task) = queue.task(id) else {
        return Err(QueueError::TaskNotFound(id).into());
    };
    if !op(queue) {
        bail!("Cannot {} task {} while it is {}", action, id, task.status);
    }
    println!("{}: {}", action, id);
    Ok(())
}

/// The persisted limit wins over the configured one, so an explicit flag
/// rewrites it before the queue is opened.
fn override_max_concurrent(config: &mut QueueConfig, max: usize) -> anyhow::Result<()> {
    if max == 0 {
        bail!("--max-concurrent must be at least 1");
    }
    config.max_concurrent = max;
    let Some(path) = config.state_file.clone() else {
        return Ok(());
    };
    let store = JsonFileStore::new(&path)
        .with_default_max_concurrent(max)
        .lock()?;
    if let Some(mut snapshot) = store.load()? {
        if snapshot.settings.max_concurrent != max {
            debug!(from = snapshot.settings.max_concurrent, to = max, "Overriding persisted concurrency");
            snapshot.settings.max_concurrent = max;
            store.save(&snapshot)?;
        }
    }
    Ok(())
}

/// Prints lifecycle transitions for `batchq run`.
struct ConsoleReporter;

impl QueueObserver for ConsoleReporter {
    fn on_task_start(&self, task: &TaskRecord) {
        println!("[start]    {} ({})", task.name, task.id);
    }

    fn on_task_complete(&self, task: &TaskRecord) {
        println!("[done]     {} in {:.1}s", task.name, task.actual_duration);
    }

    fn on_task_failed(&self, task: &TaskRecord, error: &str) {
        println!("[failed]   {}: {}", task.name, error);
    }

    fn on_progress_update(&self, task: &TaskRecord) {
        debug!(task_id = %task.id, progress = task.progress, "Progress");
    }
}

async fn run_queue(config: QueueConfig, job: CommandJob) -> anyhow::Result<()> {
    let queue = QueueController::new(config, Arc::new(job))?;
    queue.register_observer(Arc::new(ConsoleReporter));

    let status = queue.status();
    info!(
        waiting = status.waiting_tasks,
        max_concurrent = status.max_concurrent,
        "Processing queue"
    );
    queue.start();

    tokio::select! {
        _ = drained(&queue) => {
            info!("Queue drained");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            warn!("Interrupted, stopping queue");
        }
    }

    queue.shutdown().await;

    let status = queue.status();
    println!(
        "completed: {}  failed: {}  waiting: {}  cancelled: {}",
        status.status_counts.completed,
        status.status_counts.failed,
        status.status_counts.waiting,
        status.status_counts.cancelled
    );
    Ok(())
}

async fn drained(queue: &QueueController) {
    while !queue.wait_idle(Duration::from_secs(60)).await {}
}

fn print_tasks(tasks: &[TaskRecord], format: &str) -> anyhow::Result<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:<8} {:>6} {:>8} {}",
        "ID", "STATUS", "PRIORITY", "PROG", "RETRIES", "NAME"
    );
    println!("{}", "-".repeat(90));
    for task in tasks {
        println!(
            "{:<36} {:<10} {:<8} {:>5.0}% {:>8} {}",
            task.id.to_string(),
            task.status,
            task.priority,
            task.progress,
            format!("{}/{}", task.retry_count, task.max_retries),
            task.name
        );
        if let Some(error) = &task.error_message {
            println!("{:<36} {}", "", error);
        }
    }
    Ok(())
}
