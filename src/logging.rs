//! Logging wired from [`LarderConfig`].
//!
//! One entry point, [`init`], switched by how the process was invoked:
//! the long-running service gets a daily-rotated JSON file in the
//! configured logs directory plus human-readable stderr; one-shot
//! subcommands log to stderr only. `RUST_LOG` controls the filter in both
//! modes (default `info`).

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LarderConfig;

/// File name stem for the rotated service log.
const LOG_FILE_STEM: &str = "larder.log";

/// How much logging the invoked subcommand needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Long-running service: rotated JSON file plus stderr.
    Service,
    /// One-shot subcommand: stderr only, no file.
    OneShot,
}

/// Keeps the non-blocking file writer alive in service mode.
///
/// Dropping the handle flushes pending entries and closes the file; hold
/// it for the life of the process.
pub struct LogHandle {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber for the given mode.
///
/// Service mode writes `{logs_dir}/larder.log.YYYY-MM-DD`, rotating
/// daily, with `logs_dir` taken from the config.
///
/// # Errors
///
/// Fails in service mode if the logs directory cannot be created.
pub fn init(mode: LogMode, config: &LarderConfig) -> anyhow::Result<LogHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = match mode {
        LogMode::Service => {
            let dir = std::path::Path::new(&config.paths.logs_dir);
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create logs directory {}", dir.display()))?;

            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, LOG_FILE_STEM),
            );
            let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .with(console)
                .init();
            Some(guard)
        }
        LogMode::OneShot => {
            let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    };

    Ok(LogHandle {
        _file_guard: file_guard,
    })
}
