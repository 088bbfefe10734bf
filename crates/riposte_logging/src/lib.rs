//! Shared logging utilities for Riposte binaries.
//!
//! Tracing goes to two places: a daily-rolling file under the Riposte
//! logs directory (written off-thread) and stderr. The file side
//! honours `RUST_LOG`; stderr stays at warnings unless verbose mode is
//! on.

use anyhow::{Context, Result};
use riposte_protocol::paths;
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "riposte_server=info,riposte_engine=info,riposte_cluster=info,riposte_plugins=info,riposte_store=info";

/// Logging configuration shared by Riposte binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a daily-rolling file writer and stderr
/// output. The returned guard flushes buffered log lines on drop; hold
/// it for the life of the process.
pub fn init_logging(config: LogConfig<'_>) -> Result<WorkerGuard> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_appender = rolling::daily(&log_dir, format!("{}.log", file_stem(config.app_name)));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(guard)
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = paths::default_logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Log file stem: the app name with anything outside `[A-Za-z0-9_-]`
/// dropped, falling back to "riposte" if nothing survives.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
        .collect();
    if stem.is_empty() {
        "riposte".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_drops_unexpected_characters() {
        assert_eq!(file_stem("riposted"), "riposted");
        assert_eq!(file_stem("riposte server"), "riposteserver");
        assert_eq!(file_stem("a/b"), "ab");
        assert_eq!(file_stem("!!!"), "riposte");
    }
}
