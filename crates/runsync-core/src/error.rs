//! Error types for runsync-core

use std::fmt::Write;
use thiserror::Error;

pub use crate::artifact_cache::CacheError;
pub use crate::config::ConfigError;
pub use crate::logging::LogError;
pub use crate::meta_store::MetaStoreError;
pub use crate::pipeline::PipelineError;
pub use crate::replay::SyncError;
pub use crate::transport::TransportError;
pub use crate::txlog::TxLogError;
pub use crate::uploader::UploadError;

/// Coarse failure taxonomy shared by every module.
///
/// - `Durability`: the local disk refused a write. Fatal, never retried.
/// - `Transport`: the backend was unreachable or unhappy. Retried, then
///   dropped with a report.
/// - `Corruption`: a checksum or size did not match. Isolated to one entry.
/// - `Race`: contention with another writer or process. Resolved by waiting.
/// - `Config`: the settings or inputs are wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Durability,
    Transport,
    Corruption,
    Race,
    Config,
}

impl ErrorClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Durability => "durability",
            Self::Transport => "transport",
            Self::Corruption => "corruption",
            Self::Race => "race",
            Self::Config => "config",
        }
    }

    /// Whether errors of this class should stop the run.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Durability | Self::Config)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for runsync-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("transaction log error: {0}")]
    TxLog(#[from] TxLogError),

    #[error("metadata store error: {0}")]
    MetaStore(#[from] MetaStoreError),

    #[error("artifact cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging error: {0}")]
    Logging(#[from] LogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background thread or task died.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TxLog(err) => err.class(),
            Self::MetaStore(err) => err.class(),
            Self::Cache(err) => err.class(),
            Self::Pipeline(err) => err.class(),
            Self::Transport(err) => err.class(),
            Self::Upload(err) => err.class(),
            Self::Sync(err) => err.class(),
            Self::Config(_) | Self::Logging(_) => ErrorClass::Config,
            Self::Io(_) | Self::Runtime(_) => ErrorClass::Durability,
            Self::Json(_) => ErrorClass::Corruption,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        let remediation = match self {
            Self::TxLog(TxLogError::Locked { path }) => Remediation::new(format!(
                "Another process is writing {}. Wait for it to exit.",
                path.display()
            ))
            .alternative("Use `runsync inspect` to read a log that is still being written."),
            Self::Pipeline(PipelineError::Backpressure { .. }) => Remediation::new(
                "The log writer could not keep up. Raise pipeline.enqueue_timeout_ms or pipeline.queue_capacity.",
            )
            .alternative("Lower the logging rate of the instrumented code."),
            Self::MetaStore(MetaStoreError::SchemaTooNew { .. }) => Remediation::new(
                "The metadata store was written by a newer runsync. Upgrade runsync.",
            )
            .command("Check version", "runsync --version"),
            Self::Cache(CacheError::ReservationTimeout { .. }) => Remediation::new(
                "Another writer held the cache entry too long. Retry, or raise cache.wait_timeout_ms.",
            )
            .command("Reclaim cache space", "runsync cache-cleanup --target-bytes 0"),
            Self::Cache(CacheError::EntrySizeMismatch { path, .. }) => Remediation::new(format!(
                "The cached entry {} was modified outside runsync. Delete it and retry.",
                path.display()
            )),
            Self::Config(_) => Remediation::new("Fix the invalid setting and retry.")
                .alternative("Check RUNSYNC_* environment variables for stale overrides."),
            Self::Logging(_) => Remediation::new("Check the log level and log file path.")
                .alternative("Set RUST_LOG=info to override the configured level."),
            other => match other.class() {
                ErrorClass::Durability => {
                    Remediation::new("Check free disk space and permissions on the log directory.")
                        .command("Disk usage", "df -h .")
                }
                ErrorClass::Transport => Remediation::new(
                    "The backend is unreachable. Records are safe on disk; sync them later.",
                )
                .command("Sync later", "runsync sync <log_dir>"),
                ErrorClass::Corruption => Remediation::new(
                    "Some log entries failed checksum validation and were skipped.",
                )
                .command("Inspect", "runsync inspect <log_dir>"),
                ErrorClass::Race => {
                    Remediation::new("Another process holds the resource. Retry shortly.")
                }
                ErrorClass::Config => Remediation::new("Fix the invalid input and retry."),
            },
        };
        Some(remediation)
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
