//! batchq - priority queue for long-running batch jobs
//!
//! Main entry point for the batchq CLI.

mod cli;
mod command_job;
mod commands;
mod config;

use std::path::Path;
use std::sync::OnceLock;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Commands};
use crate::commands::handle_command;
use crate::config::ConfigLoader;

/// Initialize tracing with console output and, when `log_dir` is set,
/// daily rotated log files.
fn init_tracing(log_dir: Option<&Path>, default_level: &str) -> anyhow::Result<()> {
    let file_layer = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("batchq")
                .filename_suffix("log")
                .max_log_files(30)
                .build(log_dir)?;

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Keep the writer alive for the program duration
            static GUARD: OnceLock<WorkerGuard> = OnceLock::new();
            let _ = GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Console goes to stderr so `list --format json` stays parseable.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    if let Some(state_file) = &cli.state_file {
        config.queue.state_file = Some(ConfigLoader::expand(state_file));
    }
    if let Some(log_dir) = &cli.log_dir {
        config.logging.dir = Some(ConfigLoader::expand(log_dir));
    }

    let default_level = match cli.command {
        Commands::Run { .. } => "info",
        _ => "warn",
    };
    init_tracing(config.logging.dir.as_deref(), default_level)?;

    handle_command(cli.command, config).await
}
