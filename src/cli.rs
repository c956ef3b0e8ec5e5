//! CLI definitions for batchq.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use batchq_queue::{TaskId, TaskPriority, TaskStatus};

/// batchq CLI.
#[derive(Parser)]
#[command(name = "batchq")]
#[command(about = "Priority queue for long-running batch jobs")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (default: ~/.batchq/config.toml if present)
    #[arg(short, long, env = "BATCHQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Queue state file
    #[arg(long, env = "BATCHQ_STATE_FILE", global = true)]
    pub state_file: Option<PathBuf>,

    /// Directory for daily rotated log files
    #[arg(long, env = "BATCHQ_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Add one task per path
    Add {
        /// Input files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Task name (single path only; defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// Priority (urgent, high, normal, low)
        #[arg(short, long, default_value = "normal")]
        priority: TaskPriority,

        /// Manual retries allowed after a failure
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// List tasks
    List {
        /// Only show tasks in this status
        #[arg(long)]
        status: Option<TaskStatus>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Print the queue status as JSON
    Status,

    /// Pause a waiting task
    Pause {
        /// Task ID
        id: TaskId,
    },

    /// Resume a paused task
    Resume {
        /// Task ID
        id: TaskId,
    },

    /// Cancel a waiting task
    Cancel {
        /// Task ID
        id: TaskId,
    },

    /// Requeue a failed task
    Retry {
        /// Task ID
        id: TaskId,
    },

    /// Delete a task
    Remove {
        /// Task ID
        id: TaskId,
    },

    /// Change the priority of a waiting task
    Priority {
        /// Task ID
        id: TaskId,

        /// New priority (urgent, high, normal, low)
        level: TaskPriority,
    },

    /// Delete finished tasks
    Clear {
        /// Which tasks to delete
        #[arg(value_enum)]
        target: ClearTarget,
    },

    /// Process the queue with an external command until it is drained
    Run {
        /// Program to run for each task; the task path is appended to its arguments
        #[arg(long)]
        program: String,

        /// Argument passed before the task path (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Maximum concurrent jobs
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum ClearTarget {
    Completed,
    Failed,
}
