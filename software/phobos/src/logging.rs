use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{DeviceError, Result};

/// Logger thread handles, which must be kept alive for as long as the
/// logging targets will be used. Flushed automatically when dropped.
static LOGGING_GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Set up file and terminal logging.
///
/// Creates `<log_dir>/<name>.log` and installs a global subscriber with a
/// non-blocking stdout layer and a non-blocking file layer, both filtered by
/// `RUST_LOG` (default `info`). Calling this more than once is an error;
/// library users who install their own subscriber should simply not call it.
pub fn init_logging(log_dir: &Path, name: &str) -> Result<PathBuf> {
    if LOGGING_GUARDS.get().is_some() {
        return Err(DeviceError::config("logging is already initialized"));
    }

    fs::create_dir_all(log_dir)
        .map_err(|e| DeviceError::config(format!("failed to create log directory: {e}")))?;
    let log_path = log_dir.join(format!("{name}.log"));
    let logfile = OpenOptions::new()
        .create(true)
        .truncate(false)
        .append(true)
        .open(&log_path)
        .map_err(|e| DeviceError::config(format!("failed to create log file: {e}")))?;

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);

    // Filter for log level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| DeviceError::config(format!("failed to set up logging env filter: {e}")))?;

    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(stdout_writer)
        .with_target(false);

    let file_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(file_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| DeviceError::config(format!("failed to initialize logging: {e}")))?;

    let _ = LOGGING_GUARDS.set((stdout_guard, file_guard));

    Ok(log_path)
}
