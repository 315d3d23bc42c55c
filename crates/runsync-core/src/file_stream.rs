//! Mapping from log records to file-stream lines.
//!
//! Each record kind feeds one stream file on the backend:
//!
//! | record        | file            | policy                              |
//! |---------------|-----------------|-------------------------------------|
//! | `Metric`      | `history.jsonl` | append, oversized lines dropped      |
//! | `Summary`     | `summary.json`  | merged, whole file at offset 0       |
//! | `Config`      | `config.json`   | merged, whole file at offset 0       |
//! | `Console`     | `output.log`    | timestamped, `\r` overwrites in place |
//! | lifecycle/artifact | `events.jsonl` | append                          |
//!
//! `FileNotice` records do not produce lines; their paths are reported in the
//! request's `uploaded` list.
//!
//! [`StreamBatcher`] is pure: it never touches the network or the clock, so
//! replaying the same entries always yields the same requests.

use crate::record::{ConsoleStream, Envelope, FilePolicy, JsonObject, LifecycleSignal, Record};
use crate::transport::{FileChunkPayload, FileStreamRequest};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Backend stream files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamName {
    History,
    Summary,
    Config,
    Output,
    Events,
}

impl StreamName {
    pub const ALL: [Self; 5] = [
        Self::History,
        Self::Summary,
        Self::Config,
        Self::Output,
        Self::Events,
    ];

    /// File name on the backend.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::History => "history.jsonl",
            Self::Summary => "summary.json",
            Self::Config => "config.json",
            Self::Output => "output.log",
            Self::Events => "events.jsonl",
        }
    }

    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.file_name() == name)
    }

    /// Whether line offsets grow (append streams) or stay at zero.
    #[must_use]
    pub const fn is_append(self) -> bool {
        matches!(self, Self::History | Self::Output | Self::Events)
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Contiguous lines for one stream starting at a line offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub stream: StreamName,
    pub offset: u64,
    pub lines: Vec<String>,
}

/// Something the uploader must act on beyond batching lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Preempting,
    Exit(i32),
}

/// Console output with carriage-return handling.
#[derive(Debug, Default)]
struct OutputBuffer {
    pending: Vec<String>,
    /// Last chunk handed out, eligible for one in-place rewrite.
    previous: Option<(u64, Vec<String>)>,
    rewrite_used: bool,
    rewrite_offset: Option<u64>,
}

impl OutputBuffer {
    fn push(&mut self, stream: ConsoleStream, line: &str, timestamp: &str) {
        let is_err = stream == ConsoleStream::Stderr;
        let prefix = if is_err {
            format!("ERROR {timestamp} ")
        } else {
            format!("{timestamp} ")
        };

        for piece in line.split('\n') {
            let piece = piece.strip_suffix('\r').unwrap_or(piece);
            let text = piece.rsplit('\r').next().unwrap_or(piece);
            if piece.starts_with('\r') {
                self.overwrite(is_err, format!("{prefix}{text}"));
            } else if !text.is_empty() {
                self.pending.push(format!("{prefix}{text}"));
            }
        }
    }

    /// Replace the most recent line of the same stream kind.
    fn overwrite(&mut self, is_err: bool, line: String) {
        if let Some(slot) = self.pending.iter_mut().rev().find(|l| same_kind(l, is_err)) {
            *slot = line;
            return;
        }
        if !self.rewrite_used {
            if let Some((offset, mut previous)) = self.previous.take() {
                self.rewrite_used = true;
                if let Some(slot) = previous.iter_mut().rev().find(|l| same_kind(l, is_err)) {
                    *slot = line;
                    previous.append(&mut self.pending);
                    self.pending = previous;
                    self.rewrite_offset = Some(offset);
                    return;
                }
                self.previous = Some((offset, previous));
            }
        }
        self.pending.push(line);
    }

    fn take(&mut self, next_offset: u64) -> Option<StreamChunk> {
        self.rewrite_used = false;
        if self.pending.is_empty() {
            return None;
        }
        let offset = self.rewrite_offset.take().unwrap_or(next_offset);
        let lines = std::mem::take(&mut self.pending);
        self.previous = Some((offset, lines.clone()));
        Some(StreamChunk {
            stream: StreamName::Output,
            offset,
            lines,
        })
    }
}

fn same_kind(line: &str, is_err: bool) -> bool {
    line.starts_with("ERROR ") == is_err
}

/// Counters reported alongside the batcher's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub oversized_lines: u64,
    pub history_lines: u64,
    pub output_lines: u64,
    pub event_lines: u64,
}

/// Turns envelopes into pending stream chunks.
#[derive(Debug)]
pub struct StreamBatcher {
    started_at_ms: u64,
    max_line_bytes: usize,
    offsets: BTreeMap<StreamName, u64>,
    history: Vec<String>,
    events: Vec<String>,
    output: OutputBuffer,
    summary: JsonObject,
    summary_dirty: bool,
    config: JsonObject,
    config_dirty: bool,
    uploaded: BTreeSet<String>,
    uploaded_at_end: BTreeSet<String>,
    next_step: u64,
    stats: BatcherStats,
}

impl StreamBatcher {
    #[must_use]
    pub fn new(started_at_ms: u64, max_line_bytes: usize) -> Self {
        Self {
            started_at_ms,
            max_line_bytes,
            offsets: BTreeMap::new(),
            history: Vec::new(),
            events: Vec::new(),
            output: OutputBuffer::default(),
            summary: Map::new(),
            summary_dirty: false,
            config: Map::new(),
            config_dirty: false,
            uploaded: BTreeSet::new(),
            uploaded_at_end: BTreeSet::new(),
            next_step: 0,
            stats: BatcherStats::default(),
        }
    }

    /// Continue numbering from previously delivered line offsets, keyed by
    /// file name.
    #[must_use]
    pub fn with_offsets(mut self, offsets: &BTreeMap<String, u64>) -> Self {
        for (name, offset) in offsets {
            if let Some(stream) = StreamName::from_file_name(name) {
                if stream.is_append() {
                    self.offsets.insert(stream, *offset);
                }
            }
        }
        self
    }

    /// Next line offset per append stream, keyed by file name.
    #[must_use]
    pub fn offsets(&self) -> BTreeMap<String, u64> {
        StreamName::ALL
            .into_iter()
            .filter(|s| s.is_append())
            .map(|s| (s.file_name().to_string(), self.offset(s)))
            .collect()
    }

    #[must_use]
    pub fn offset(&self, stream: StreamName) -> u64 {
        self.offsets.get(&stream).copied().unwrap_or(0)
    }

    #[must_use]
    pub const fn stats(&self) -> BatcherStats {
        self.stats
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.history.is_empty()
            || !self.events.is_empty()
            || !self.output.pending.is_empty()
            || self.summary_dirty
            || self.config_dirty
            || !self.uploaded.is_empty()
    }

    #[must_use]
    pub fn pending_lines(&self) -> usize {
        self.history.len() + self.events.len() + self.output.pending.len()
    }

    /// Rebuild merged state from an entry that was already delivered,
    /// without queueing anything.
    pub fn absorb(&mut self, envelope: &Envelope) {
        match &envelope.record {
            Record::Summary { values } => merge(&mut self.summary, values),
            Record::Config { values } => merge(&mut self.config, values),
            Record::Metric { step, .. } => {
                self.next_step = self.next_step.max(step.map_or(self.next_step, |s| s) + 1);
            }
            _ => {}
        }
    }

    /// Queue lines for one envelope.
    pub fn push(&mut self, envelope: &Envelope) -> Option<Control> {
        let created = envelope.created_at_ms;
        match &envelope.record {
            Record::Metric { step, values } => {
                let step = step.unwrap_or(self.next_step);
                self.next_step = self.next_step.max(step + 1);
                let mut row = values.clone();
                row.insert("_step".into(), Value::from(step));
                row.insert("_runtime".into(), Value::from(self.runtime_secs(created)));
                row.insert("_timestamp".into(), Value::from(created as f64 / 1000.0));
                let line = Value::Object(row).to_string();
                if line.len() > self.max_line_bytes {
                    self.stats.oversized_lines += 1;
                    tracing::error!(
                        stream = %StreamName::History,
                        seq = envelope.seq,
                        bytes = line.len(),
                        max_bytes = self.max_line_bytes,
                        "metric row exceeds the line size limit; dropping it"
                    );
                } else {
                    self.history.push(line);
                }
                None
            }
            Record::Summary { values } => {
                merge(&mut self.summary, values);
                self.summary_dirty = true;
                None
            }
            Record::Config { values } => {
                merge(&mut self.config, values);
                self.config_dirty = true;
                None
            }
            Record::FileNotice { path, policy } => {
                match policy {
                    FilePolicy::End => self.uploaded_at_end.insert(path.clone()),
                    FilePolicy::Now | FilePolicy::Live => self.uploaded.insert(path.clone()),
                };
                None
            }
            Record::Console { stream, line } => {
                self.output.push(*stream, line, &format_timestamp(created));
                None
            }
            Record::Lifecycle { signal } => {
                let mut event = Map::new();
                let (name, control) = match signal {
                    LifecycleSignal::Pause => ("pause", None),
                    LifecycleSignal::Resume => ("resume", None),
                    LifecycleSignal::Preempting => ("preempting", Some(Control::Preempting)),
                    LifecycleSignal::Exit { exit_code } => {
                        event.insert("exit_code".into(), Value::from(*exit_code));
                        ("exit", Some(Control::Exit(*exit_code)))
                    }
                };
                event.insert("_event".into(), Value::from(name));
                self.push_event(event, created);
                if matches!(control, Some(Control::Exit(_))) {
                    self.uploaded.append(&mut self.uploaded_at_end);
                }
                control
            }
            Record::ArtifactRef {
                name,
                digest,
                entries,
            } => {
                let mut event = Map::new();
                event.insert("_event".into(), Value::from("artifact"));
                event.insert("name".into(), Value::from(name.as_str()));
                event.insert("digest".into(), Value::from(digest.as_str()));
                event.insert(
                    "entries".into(),
                    serde_json::to_value(entries).unwrap_or(Value::Null),
                );
                self.push_event(event, created);
                None
            }
        }
    }

    fn push_event(&mut self, mut event: JsonObject, created_ms: u64) {
        event.insert("_runtime".into(), Value::from(self.runtime_secs(created_ms)));
        event.insert("_timestamp".into(), Value::from(created_ms as f64 / 1000.0));
        self.events.push(Value::Object(event).to_string());
    }

    fn runtime_secs(&self, created_ms: u64) -> f64 {
        created_ms.saturating_sub(self.started_at_ms) as f64 / 1000.0
    }

    /// Hand out every pending chunk and advance the line offsets.
    pub fn take_chunks(&mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();

        for (stream, lines) in [
            (StreamName::History, std::mem::take(&mut self.history)),
            (StreamName::Events, std::mem::take(&mut self.events)),
        ] {
            if !lines.is_empty() {
                chunks.push(self.append_chunk(stream, lines));
            }
        }

        if let Some(chunk) = self.output.take(self.offset(StreamName::Output)) {
            let next = chunk.offset + chunk.lines.len() as u64;
            self.stats.output_lines += chunk.lines.len() as u64;
            self.offsets.insert(StreamName::Output, next);
            chunks.push(chunk);
        }

        if std::mem::take(&mut self.summary_dirty) {
            chunks.push(whole_file(StreamName::Summary, &self.summary));
        }
        if std::mem::take(&mut self.config_dirty) {
            chunks.push(whole_file(StreamName::Config, &self.config));
        }
        chunks
    }

    fn append_chunk(&mut self, stream: StreamName, lines: Vec<String>) -> StreamChunk {
        let offset = self.offset(stream);
        let count = lines.len() as u64;
        match stream {
            StreamName::History => self.stats.history_lines += count,
            StreamName::Events => self.stats.event_lines += count,
            _ => {}
        }
        self.offsets.insert(stream, offset + count);
        StreamChunk {
            stream,
            offset,
            lines,
        }
    }

    /// Take everything pending as one request body.
    pub fn take_request(&mut self, dropped: u64) -> FileStreamRequest {
        let mut request = FileStreamRequest {
            dropped,
            uploaded: std::mem::take(&mut self.uploaded).into_iter().collect(),
            ..FileStreamRequest::default()
        };
        for chunk in self.take_chunks() {
            request.files.insert(
                chunk.stream.file_name().to_string(),
                FileChunkPayload {
                    offset: chunk.offset,
                    content: chunk.lines,
                },
            );
        }
        request
    }
}

fn merge(target: &mut JsonObject, update: &JsonObject) {
    for (key, value) in update {
        target.insert(key.clone(), value.clone());
    }
}

fn whole_file(stream: StreamName, values: &JsonObject) -> StreamChunk {
    StreamChunk {
        stream,
        offset: 0,
        lines: vec![Value::Object(values.clone()).to_string()],
    }
}

fn format_timestamp(epoch_ms: u64) -> String {
    let ms = i64::try_from(epoch_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Split a request whose JSON body exceeds `max_bytes`.
///
/// Files go into separate requests, and a single oversized file is cut into
/// line ranges. `uploaded` rides on the first part; the terminal flags
/// (`complete`, `exitcode`, `preempting`) ride on the last so the backend
/// sees them after every line.
#[must_use]
pub fn split_request(request: FileStreamRequest, max_bytes: usize) -> Vec<FileStreamRequest> {
    if request.encoded_len() <= max_bytes || request.files.is_empty() {
        return vec![request];
    }

    let FileStreamRequest {
        files,
        dropped,
        uploaded,
        complete,
        exitcode,
        preempting,
    } = request;

    let mut parts: Vec<FileStreamRequest> = Vec::new();
    let empty = FileStreamRequest {
        dropped,
        ..FileStreamRequest::default()
    };
    let budget = max_bytes.saturating_sub(empty.encoded_len() + 64);

    for (name, chunk) in files {
        let mut offset = chunk.offset;
        let mut lines: Vec<String> = Vec::new();
        let mut bytes = 0usize;
        for line in chunk.content {
            let cost = serde_json::to_string(&line).map_or(line.len(), |quoted| quoted.len()) + 1;
            if !lines.is_empty() && bytes + cost > budget {
                let count = lines.len() as u64;
                parts.push(single_file(&empty, &name, offset, std::mem::take(&mut lines)));
                offset += count;
                bytes = 0;
            }
            bytes += cost;
            lines.push(line);
        }
        if !lines.is_empty() {
            parts.push(single_file(&empty, &name, offset, lines));
        }
    }

    if let Some(first) = parts.first_mut() {
        first.uploaded = uploaded;
    }
    if let Some(last) = parts.last_mut() {
        last.complete = complete;
        last.exitcode = exitcode;
        last.preempting = preempting;
    }
    parts
}

fn single_file(template: &FileStreamRequest, name: &str, offset: u64, lines: Vec<String>) -> FileStreamRequest {
    let mut part = template.clone();
    part.files.insert(
        name.to_string(),
        FileChunkPayload {
            offset,
            content: lines,
        },
    );
    part
}
