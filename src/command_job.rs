//! Job body that runs an external program per task.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use batchq_queue::{JobContext, JobError, JobRunner, TaskRecord};

/// Runs `program args... <task path>` for each task.
///
/// Stdout lines of the form `42%` or `42.5%` are reported as progress. The
/// last non-empty stderr line becomes the failure message. The child is
/// killed when the task is cancelled.
pub(crate) struct CommandJob {
    program: String,
    args: Vec<String>,
}

impl CommandJob {
    pub(crate) fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl JobRunner for CommandJob {
    async fn run(&self, task: TaskRecord, ctx: JobContext) -> Result<(), JobError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&task.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(task_id = %task.id, pid = ?child.id(), program = %self.program, "Spawned job process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let progress_ctx = ctx.clone();

        let progress = async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = parse_progress(&line) {
                    progress_ctx.report_progress(percent);
                }
            }
        };
        let last_error = async move {
            let mut last = String::new();
            let Some(stderr) = stderr else { return last };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    last = line.to_string();
                }
            }
            last
        };

        let finished = {
            let run = async {
                let (status, (), last) = tokio::join!(child.wait(), progress, last_error);
                (status, last)
            };
            tokio::select! {
                finished = run => Some(finished),
                _ = ctx.cancelled() => None,
            }
        };

        let Some((status, last_error)) = finished else {
            warn!(task_id = %task.id, "Killing job process");
            if let Err(e) = child.kill().await {
                warn!(task_id = %task.id, "Failed to kill job process: {}", e);
            }
            return Err(JobError::Cancelled);
        };

        let status = status?;
        if status.success() {
            return Ok(());
        }
        let mut message = format!("{} exited with {}", self.program, status);
        if !last_error.is_empty() {
            message.push_str(": ");
            message.push_str(&last_error);
        }
        Err(JobError::Failed(message))
    }
}

fn parse_progress(line: &str) -> Option<f64> {
    line.trim().strip_suffix('%')?.trim().parse().ok()
}
