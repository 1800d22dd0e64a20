//! Logging bootstrap for the host compositor process.
//!
//! The scheduler only emits through the `tracing` macros, so hosts with
//! their own subscriber need none of this. The bootstrap exists for
//! compositors that want scheduler-friendly defaults: every record carries
//! its thread name, because telling the dispatch, timer and event threads
//! apart is usually the first step when a wakeup goes missing.

use crate::error::LoggingError;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log directory under the user's home.
const LOG_DIR: &str = ".local/share/vsync-scheduler";

/// Daily files kept before rotation reclaims them.
const MAX_LOG_FILES: usize = 3;

/// Keeps the non-blocking log writers alive.
/// Must be held for the lifetime of the host process.
pub struct LogGuard {
    _file: WorkerGuard,
    _stderr: WorkerGuard,
}

/// Install a subscriber with compact stderr output and a daily-rotating
/// JSON file under ~/.local/share/vsync-scheduler.
///
/// The filter defaults to `info`; raise individual targets through
/// `RUST_LOG` (e.g. `vsync_scheduler::dispatch=trace`) when chasing wakeup
/// timing.
pub fn init_logging() -> Result<LogGuard, LoggingError> {
    init_logging_to(&default_log_directory()?)
}

/// As [`init_logging`], but writing the rotating file under `log_dir`.
pub fn init_logging_to(log_dir: &Path) -> Result<LogGuard, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|e| LoggingError::CreateDirectory {
        path: log_dir.display().to_string(),
        source: e,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix("scheduler")
        .filename_suffix("log")
        .build(log_dir)
        .map_err(|e| LoggingError::CreateAppender(e.to_string()))?;

    // Non-blocking writers: the dispatch and event threads must never
    // stall on log IO.
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stderr_writer, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .json()
        .with_thread_names(true)
        .with_writer(file_writer);
    let stderr_layer = fmt::layer()
        .compact()
        .with_thread_names(true)
        .with_writer(stderr_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LogGuard {
        _file: file_guard,
        _stderr: stderr_guard,
    })
}

fn default_log_directory() -> Result<PathBuf, LoggingError> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| LoggingError::NoHomeDirectory)?;
    Ok(PathBuf::from(home).join(LOG_DIR))
}
