//! Configuration for runsync.
//!
//! [`Settings`] is loaded from TOML, then patched from `RUNSYNC_*`
//! environment variables, then validated. Every section defaults, so an empty
//! file (or no file) is a valid configuration.
//!
//! ```toml
//! [log]
//! level = "debug"
//! format = "json"
//!
//! [durability]
//! mode = "batched"
//! max_entries = 64
//! max_interval_ms = 200
//!
//! [pipeline]
//! queue_capacity = 4096
//! best_effort_kinds = ["console"]
//!
//! [upload]
//! batch_window_ms = 2000
//! heartbeat_secs = 30
//!
//! [upload.retry]
//! max_attempts = 30
//! max_delay_secs = 300
//!
//! [backend]
//! base_url = "https://collector.example"
//! ```

use crate::artifact_cache::{CacheConfig, default_cache_root};
use crate::logging::LogConfig;
use crate::pipeline::PipelineConfig;
use crate::record::RecordKind;
use crate::retry::RetryPolicy;
use crate::txlog::DurabilityPolicy;
use crate::uploader::UploadConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid value {value:?} in environment variable {var}")]
    Env { var: &'static str, value: String },
}

/// `[pipeline]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    /// Record kinds that may be dropped when the queue is full.
    pub best_effort_kinds: Vec<RecordKind>,
    pub coalesce_duplicate_summaries: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            enqueue_timeout_ms: 5_000,
            best_effort_kinds: vec![RecordKind::Console],
            coalesce_duplicate_summaries: true,
        }
    }
}

/// `[upload.retry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    pub backoff_factor: f64,
    pub jitter_percent: f64,
    pub max_attempts: Option<u32>,
    pub max_elapsed_secs: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::file_stream();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_secs: policy.max_delay.as_secs(),
            backoff_factor: policy.backoff_factor,
            jitter_percent: policy.jitter_percent,
            max_attempts: policy.max_attempts,
            max_elapsed_secs: policy.max_elapsed.map(|d| d.as_secs()),
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_secs(self.max_delay_secs),
            self.backoff_factor,
            self.jitter_percent,
            self.max_attempts,
            self.max_elapsed_secs.map(Duration::from_secs),
        )
    }
}

/// `[upload]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub batch_window_ms: u64,
    pub heartbeat_secs: u64,
    /// How often the uploader checks the log for new entries.
    pub poll_interval_ms: u64,
    pub max_line_bytes: usize,
    pub max_request_bytes: usize,
    /// Follow server-sent limits and run-age pacing.
    pub dynamic_limits: bool,
    pub max_entries_per_flush: usize,
    pub retry: RetrySettings,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            batch_window_ms: 2_000,
            heartbeat_secs: 30,
            poll_interval_ms: 100,
            max_line_bytes: 10 * 1024 * 1024,
            max_request_bytes: 10 * 1024 * 1024,
            dynamic_limits: true,
            max_entries_per_flush: 10_000,
            retry: RetrySettings::default(),
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Defaults to the platform cache directory.
    pub dir: Option<PathBuf>,
    /// Cache size limit. Stores past it evict the oldest entries, and
    /// `cache-cleanup` trims to it when no target is given.
    pub budget_bytes: Option<u64>,
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub stale_grace_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            budget_bytes: None,
            wait_timeout_ms: 60_000,
            poll_interval_ms: 50,
            stale_grace_ms: 2_000,
        }
    }
}

/// `[backend]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Collector base URL; no URL means offline.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub entity: Option<String>,
    pub project: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: 30,
            entity: None,
            project: None,
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.base_url.as_deref().is_none_or(|url| url.trim().is_empty())
    }
}

/// Every runsync setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogConfig,
    pub durability: DurabilityPolicy,
    pub pipeline: PipelineSettings,
    pub upload: UploadSettings,
    pub cache: CacheSettings,
    pub backend: BackendConfig,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        Ok(settings)
    }

    /// Load from `path`, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_toml_str(&text)?;
        settings.apply_env_overrides()?;
        settings.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(settings)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|value| !value.trim().is_empty());

        if let Some(url) = get("RUNSYNC_BASE_URL") {
            self.backend.base_url = Some(url);
        }
        if let Some(key) = get("RUNSYNC_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(value) = get("RUNSYNC_DURABILITY") {
            self.durability = DurabilityPolicy::from_name(&value).ok_or(ConfigError::Env {
                var: "RUNSYNC_DURABILITY",
                value,
            })?;
        }
        if let Some(ms) = parse_env(&get, "RUNSYNC_BATCH_WINDOW_MS")? {
            self.upload.batch_window_ms = ms;
        }
        if let Some(secs) = parse_env(&get, "RUNSYNC_HEARTBEAT_SECS")? {
            self.upload.heartbeat_secs = secs;
        }
        if let Some(attempts) = parse_env(&get, "RUNSYNC_RETRY_MAX_ATTEMPTS")? {
            self.upload.retry.max_attempts = Some(attempts);
        }
        if let Some(secs) = parse_env(&get, "RUNSYNC_RETRY_MAX_DELAY_SECS")? {
            self.upload.retry.max_delay_secs = secs;
        }
        if let Some(secs) = parse_env(&get, "RUNSYNC_RETRY_MAX_ELAPSED_SECS")? {
            self.upload.retry.max_elapsed_secs = Some(secs);
        }
        if let Some(dir) = get("RUNSYNC_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(bytes) = parse_env(&get, "RUNSYNC_CACHE_BUDGET_BYTES")? {
            self.cache.budget_bytes = Some(bytes);
        }
        if let Some(level) = get("RUNSYNC_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity", "must be at least 1");
        }
        if self.pipeline.enqueue_timeout_ms == 0 {
            return invalid("pipeline.enqueue_timeout_ms", "must be at least 1");
        }
        if let DurabilityPolicy::Batched {
            max_entries,
            max_interval_ms,
        } = self.durability
        {
            if max_entries == 0 || max_interval_ms == 0 {
                return invalid("durability", "batched limits must be non-zero");
            }
        }
        if self.upload.batch_window_ms == 0 {
            return invalid("upload.batch_window_ms", "must be at least 1");
        }
        if self.upload.heartbeat_secs == 0 {
            return invalid("upload.heartbeat_secs", "must be at least 1");
        }
        if self.upload.poll_interval_ms == 0 {
            return invalid("upload.poll_interval_ms", "must be at least 1");
        }
        if self.upload.max_request_bytes < 1024 {
            return invalid("upload.max_request_bytes", "must be at least 1024");
        }
        if self.upload.max_line_bytes == 0 {
            return invalid("upload.max_line_bytes", "must be at least 1");
        }
        if self.upload.max_entries_per_flush == 0 {
            return invalid("upload.max_entries_per_flush", "must be at least 1");
        }
        if self.upload.retry.max_attempts == Some(0) {
            return invalid("upload.retry.max_attempts", "must be at least 1");
        }
        if !self.upload.retry.backoff_factor.is_finite() {
            return invalid("upload.retry.backoff_factor", "must be a finite number");
        }
        if self.cache.poll_interval_ms == 0 {
            return invalid("cache.poll_interval_ms", "must be at least 1");
        }
        if let Some(url) = &self.backend.base_url {
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                return invalid("backend.base_url", "must start with http:// or https://");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.pipeline.queue_capacity,
            enqueue_timeout: Duration::from_millis(self.pipeline.enqueue_timeout_ms),
            best_effort_kinds: self.pipeline.best_effort_kinds.clone(),
            coalesce_duplicate_summaries: self.pipeline.coalesce_duplicate_summaries,
            durability: self.durability,
        }
    }

    #[must_use]
    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            batch_window: Duration::from_millis(self.upload.batch_window_ms),
            heartbeat: Duration::from_secs(self.upload.heartbeat_secs),
            poll_interval: Duration::from_millis(self.upload.poll_interval_ms),
            max_line_bytes: self.upload.max_line_bytes,
            max_request_bytes: self.upload.max_request_bytes,
            dynamic_limits: self.upload.dynamic_limits,
            max_entries_per_flush: self.upload.max_entries_per_flush,
            retry: self.upload.retry.policy(),
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            root: self.cache.dir.clone().unwrap_or_else(default_cache_root),
            wait_timeout: Duration::from_millis(self.cache.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.cache.poll_interval_ms),
            stale_grace: Duration::from_millis(self.cache.stale_grace_ms),
            budget_bytes: self.cache.budget_bytes,
        }
    }
}

fn parse_env<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}
