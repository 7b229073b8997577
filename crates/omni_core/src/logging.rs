//! Structured logging setup with console and file output.
//!
//! Provides:
//! - Daily rotating log files
//! - Build-type conditional log levels
//! - Console-only fallback when file logging fails
//! - Filter override, first usable of: explicit filter, `OMNI_LOG`, `RUST_LOG`

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log directory.
pub const LOG_DIR_ENV: &str = "OMNI_LOG_DIR";

/// Filter variables, highest priority first.
pub const FILTER_ENV_VARS: [&str; 2] = ["OMNI_LOG", "RUST_LOG"];

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether stdout is a terminal (skips the file sink)
    pub is_tty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a new logging configuration.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_tty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Guard that must be held for the lifetime of the process.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Initialize logging with the given configuration.
///
/// If file logging initialization fails, falls back to console-only.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_tty {
        return init_stdout_logging(config.log_filter.as_deref());
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {}. Using console only.", e);
            init_stdout_logging(config.log_filter.as_deref())
        }
    }
}

/// Initialize stdout-only logging.
fn init_stdout_logging(filter: Option<&str>) -> LoggingGuard {
    let env_filter = build_env_filter(filter);

    // try_init: a subscriber may already be installed (tests, embedding apps)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();

    LoggingGuard { _worker_guard: None }
}

/// Initialize file + console logging.
fn init_file_logging(config: &LogConfig) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("omni")
        .filename_suffix("log")
        .build(&config.log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Combine stdout and file output
    let stdout = std::io::stdout.with_max_level(tracing::Level::INFO);
    let combined = stdout.and(non_blocking);

    let env_filter = build_env_filter(config.log_filter.as_deref());

    tracing_subscriber::fmt()
        .with_writer(combined)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| e.to_string())?;

    Ok(guard)
}

fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    EnvFilter::new(filter_directive(custom_filter, |key| std::env::var(key).ok()))
}

/// Pick the filter directive to run with.
///
/// The explicit filter wins, then each of [`FILTER_ENV_VARS`] in order, then
/// [`default_log_filter`]. Blank or unparsable candidates are skipped.
pub fn filter_directive(custom: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> String {
    fn usable(directive: &str) -> bool {
        !directive.trim().is_empty() && EnvFilter::try_new(directive).is_ok()
    }

    if let Some(filter) = custom.filter(|f| usable(f)) {
        return filter.to_string();
    }
    FILTER_ENV_VARS
        .iter()
        .filter_map(|&key| lookup(key))
        .find(|value| usable(value))
        .unwrap_or_else(|| default_log_filter().to_string())
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "debug,omni=trace,omni_core=trace,tokio_postgres=warn,sqlx=warn,russh=info"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,omni=info,omni_core=info,tokio_postgres=warn,sqlx=warn,russh=warn"
    }
}

/// Get the log directory: `OMNI_LOG_DIR`, else `<data_local_dir>/omni/logs`.
pub fn log_dir() -> PathBuf {
    log_dir_from(|key| std::env::var_os(key).map(|v| v.to_string_lossy().into_owned()))
}

fn log_dir_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    match lookup(LOG_DIR_ENV).filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("omni").join("logs"),
    }
}
