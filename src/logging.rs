//! Logging setup for the stagehand binary.
//!
//! Human-readable output goes to stderr so stdout stays free for command
//! output. A JSON copy of every event is appended to
//! `.stagehand/logs/stagehand.log` through a non-blocking writer.
//! `RUST_LOG` overrides the default level.

use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE: &str = "stagehand.log";

/// Keep alive for as long as events should reach the log file. Dropping it
/// flushes the writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "stagehand=debug,info" } else { "info" }
}

/// Filter from `RUST_LOG`, or the default for the verbosity.
pub fn build_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(log_dir: &Path, verbose: bool) -> Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(build_filter(verbose))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
