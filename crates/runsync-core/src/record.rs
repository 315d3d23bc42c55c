//! Record model shared by producers, the transaction log and the uploader.
//!
//! A [`Record`] is what instrumented code hands to the pipeline. The writer
//! wraps it in an [`Envelope`] (producer attribution plus sequence numbers)
//! before framing it into the log. Both are serialized as JSON; the set of
//! record kinds is closed, so an entry carrying an unknown `kind` fails to
//! decode instead of being accepted as an arbitrary shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier the pipeline assigns to each producer handle.
pub type ProducerId = u32;

/// JSON object payload carried by metric, config and summary records.
pub type JsonObject = Map<String, Value>;

/// Console stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// When a noticed file should be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePolicy {
    Now,
    Live,
    End,
}

/// Lifecycle signals recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum LifecycleSignal {
    Pause,
    Resume,
    Preempting,
    Exit { exit_code: i32 },
}

/// One file inside an artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub digest: String,
    pub size: u64,
}

/// A single piece of run telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// A history point.
    Metric {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<u64>,
        values: JsonObject,
    },
    /// Configuration update (merged, last value wins).
    Config { values: JsonObject },
    /// Summary update (merged, last value wins).
    Summary { values: JsonObject },
    /// A file the run wants uploaded.
    FileNotice { path: String, policy: FilePolicy },
    /// One captured console line.
    Console { stream: ConsoleStream, line: String },
    /// Pause, resume, preemption or exit.
    Lifecycle { signal: LifecycleSignal },
    /// Reference to a logged artifact.
    ArtifactRef {
        name: String,
        digest: String,
        #[serde(default)]
        entries: Vec<ArtifactEntry>,
    },
}

/// Discriminant of [`Record`], used for drop policies and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Metric,
    Config,
    Summary,
    FileNotice,
    Console,
    Lifecycle,
    ArtifactRef,
}

impl RecordKind {
    pub const ALL: [Self; 7] = [
        Self::Metric,
        Self::Config,
        Self::Summary,
        Self::FileNotice,
        Self::Console,
        Self::Lifecycle,
        Self::ArtifactRef,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Config => "config",
            Self::Summary => "summary",
            Self::FileNotice => "file_notice",
            Self::Console => "console",
            Self::Lifecycle => "lifecycle",
            Self::ArtifactRef => "artifact_ref",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown record kind: {s}"))
    }
}

impl Record {
    /// History point from a JSON object; non-object values are rejected.
    pub fn metric(step: Option<u64>, values: Value) -> Option<Self> {
        match values {
            Value::Object(values) => Some(Self::Metric { step, values }),
            _ => None,
        }
    }

    pub fn summary(values: Value) -> Option<Self> {
        match values {
            Value::Object(values) => Some(Self::Summary { values }),
            _ => None,
        }
    }

    pub fn config(values: Value) -> Option<Self> {
        match values {
            Value::Object(values) => Some(Self::Config { values }),
            _ => None,
        }
    }

    pub fn console(stream: ConsoleStream, line: impl Into<String>) -> Self {
        Self::Console {
            stream,
            line: line.into(),
        }
    }

    pub const fn lifecycle(signal: LifecycleSignal) -> Self {
        Self::Lifecycle { signal }
    }

    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Metric { .. } => RecordKind::Metric,
            Self::Config { .. } => RecordKind::Config,
            Self::Summary { .. } => RecordKind::Summary,
            Self::FileNotice { .. } => RecordKind::FileNotice,
            Self::Console { .. } => RecordKind::Console,
            Self::Lifecycle { .. } => RecordKind::Lifecycle,
            Self::ArtifactRef { .. } => RecordKind::ArtifactRef,
        }
    }

    /// Exit code if this is an exit record.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Lifecycle {
                signal: LifecycleSignal::Exit { exit_code },
            } => Some(*exit_code),
            _ => None,
        }
    }
}

/// What the transaction log stores for every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Global sequence number assigned by the log writer.
    pub seq: u64,
    pub producer_id: ProducerId,
    /// Per-producer sequence number, strictly increasing per producer.
    pub producer_seq: u64,
    /// OS process id of the producer.
    pub pid: u32,
    /// Creation time on the producer side (epoch ms).
    pub created_at_ms: u64,
    pub record: Record,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn epoch_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
