//! Structured logging for runsync
//!
//! Diagnostics go through `tracing`; this module installs the global
//! subscriber once per process.
//!
//! # Features
//!
//! - **Pretty format**: human-friendly output on stderr
//! - **JSON format**: one JSON object per line for CI and log shippers
//! - **File output**: optional log file, created `0600` under a `0700` parent
//!
//! # Usage
//!
//! ```ignore
//! use runsync_core::logging::{init_logging, LogConfig};
//! use runsync_core::config::LogFormat;
//!
//! let config = LogConfig {
//!     level: "info".to_string(),
//!     format: LogFormat::Json,
//!     file: None,
//! };
//! init_logging(&config)?;
//! ```
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `run_id`: run identifier
//! - `stream`: file-stream name (`history.jsonl`, `output.log`, ...)
//! - `offset`: log byte offset or stream line offset
//! - `producer_id`: pipeline producer handle
//! - `attempt`, `delay_ms`, `status`: retry context
//!
//! Never log record payloads (metric values, console lines); they may
//! contain user secrets.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Logging configuration (`[log]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub level: String,

    pub format: LogFormat,

    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &std::path::Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let existed = parent.exists();
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            if !existed {
                let permissions = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(parent, permissions)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &std::path::Path, mode: u32) -> io::Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions)
}

/// Build the level filter: `RUST_LOG` if set, the configured level otherwise.
fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|_| LogError::InvalidLevel(level.to_string()))
}

/// Initialize the global logging subscriber.
///
/// Subsequent calls return `Err(LogError::AlreadyInitialized)`.
/// `RUST_LOG` (e.g. `RUST_LOG=runsync_core=debug`) overrides the configured
/// level.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = build_filter(&config.level)?;

    let file_writer = if let Some(path) = &config.file {
        ensure_parent_dir(path)?;
        let existed = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        #[cfg(unix)]
        if !existed {
            set_file_permissions(path, 0o600)?;
        }
        Some(file)
    } else {
        None
    };

    match config.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_span_events(FmtSpan::NONE)
                    .with_ansi(true),
            );

            if let Some(file) = file_writer {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_ansi(false);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            );

            if let Some(file) = file_writer {
                let file_layer = fmt::layer()
                    .json()
                    .with_writer(file)
                    .with_timer(SystemTime)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "logging initialized"
    );

    Ok(())
}

pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Create a span carrying the run correlation fields.
///
/// ```ignore
/// let span = runsync_core::run_span!("upload", run_id = %target.run_id);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! run_span {
    ($name:expr $(, $($field:tt)+)?) => {
        tracing::info_span!($name $(, $($field)+)?)
    };
}

/// Log levels accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}
