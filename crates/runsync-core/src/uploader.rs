//! File-stream uploader: drains a run log to the backend.
//!
//! Two layers:
//!
//! - [`StreamUploader`] owns the batching, pacing and retry logic. It turns
//!   envelopes into `file_stream` requests and posts them through a
//!   [`Transport`], dropping (live runs) or failing (sync) when retries run
//!   out.
//! - [`UploadSession`] ties a `StreamUploader` to a log on disk: it tails the
//!   log from the consumer's checkpoint and commits a new checkpoint to the
//!   metadata store only after the backend acknowledged (or the uploader
//!   explicitly dropped) everything up to that offset.
//!
//! Live runs drive a session with [`UploadSession::run`]; the replayer uses
//! [`UploadSession::drain_to_end`].

use crate::error::ErrorClass;
use crate::file_stream::{Control, StreamBatcher, split_request};
use crate::meta_store::{MetaStore, MetaStoreError, UploadCheckpoint};
use crate::record::{Envelope, epoch_ms_now};
use crate::retry::{RetryPolicy, with_retry_outcome};
use crate::run::RunTarget;
use crate::transport::{FileStreamRequest, FileStreamResponse, Transport, TransportError};
use crate::txlog::{FILE_HEADER_LEN, LOG_FILE_NAME, TxLogError, TxLogReader};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Uploader tuning, usually built by [`crate::config::Settings::upload_config`].
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Minimum time between two posts carrying lines.
    pub batch_window: Duration,
    /// Idle time before a heartbeat request; the server may change it.
    pub heartbeat: Duration,
    /// How often a live session looks for new log entries.
    pub poll_interval: Duration,
    pub max_line_bytes: usize,
    pub max_request_bytes: usize,
    pub retry: RetryPolicy,
    /// Follow server limits and run-age pacing.
    pub dynamic_limits: bool,
    /// Log entries read per poll.
    pub max_entries_per_flush: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_secs(2),
            heartbeat: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            max_line_bytes: 10 * 1024 * 1024,
            max_request_bytes: 10 * 1024 * 1024,
            retry: RetryPolicy::file_stream(),
            dynamic_limits: true,
            max_entries_per_flush: 10_000,
        }
    }
}

/// What to do with a request that could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Count it as dropped and move on (live runs).
    AdvancePastDropped,
    /// Fail without advancing the checkpoint (sync).
    StopAtFailure,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Log(#[from] TxLogError),

    #[error(transparent)]
    Meta(#[from] MetaStoreError),

    #[error("delivery of {lines} lines failed after {attempts} attempts: {source}")]
    Delivery {
        attempts: u32,
        lines: usize,
        #[source]
        source: TransportError,
    },
}

impl UploadError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Log(err) => err.class(),
            Self::Meta(err) => err.class(),
            Self::Delivery { source, .. } => source.class(),
        }
    }
}

/// Totals for one uploader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    /// HTTP requests made, retries included.
    pub requests: u64,
    pub retries: u64,
    pub heartbeats: u64,
    pub bytes_sent: u64,
    pub lines_sent: u64,
    pub dropped_chunks: u64,
    pub corrupt_entries: u64,
    pub oversized_lines: u64,
    /// The final request (with exit code) was acknowledged.
    pub complete: bool,
    pub exit_code: Option<i32>,
    /// Next log offset after the last acknowledged entry.
    pub acked_offset: u64,
}

/// Result of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Idle,
    Delivered,
    /// At least one part was given up on.
    Dropped,
}

/// Server pacing derived from the heartbeat and the age of the run.
///
/// Young runs post often so the first metrics show up quickly; older runs
/// settle at one post per heartbeat.
#[must_use]
pub fn run_age_pacing(heartbeat: Duration, run_age: Duration) -> Duration {
    let hb = heartbeat.as_secs_f64();
    let secs = match run_age.as_secs() {
        0..60 => (hb / 15.0).max(1.0),
        60..300 => (hb / 3.0).max(2.5),
        _ => hb.max(5.0),
    };
    Duration::from_secs_f64(secs)
}

/// Batching, pacing and delivery for one run target.
pub struct StreamUploader<T> {
    transport: T,
    target: RunTarget,
    config: UploadConfig,
    batcher: StreamBatcher,
    drop_policy: DropPolicy,
    heartbeat: Duration,
    started_at_ms: u64,
    last_post: Instant,
    preempting_pending: bool,
    exit_code: Option<i32>,
    final_attempted: bool,
    summary: UploadSummary,
}

impl<T> std::fmt::Debug for StreamUploader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamUploader")
            .field("target", &self.target)
            .field("drop_policy", &self.drop_policy)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> StreamUploader<T> {
    pub fn new(
        transport: T,
        target: RunTarget,
        config: UploadConfig,
        batcher: StreamBatcher,
        started_at_ms: u64,
        drop_policy: DropPolicy,
    ) -> Self {
        let heartbeat = config.heartbeat;
        Self {
            transport,
            target,
            config,
            batcher,
            drop_policy,
            heartbeat,
            started_at_ms,
            last_post: Instant::now(),
            preempting_pending: false,
            exit_code: None,
            final_attempted: false,
            summary: UploadSummary::default(),
        }
    }

    /// Carry over counters from a checkpoint.
    pub fn resume_from(&mut self, dropped_chunks: u64, complete: bool) {
        self.summary.dropped_chunks = dropped_chunks;
        self.summary.complete = complete;
        self.final_attempted = complete;
    }

    #[must_use]
    pub const fn target(&self) -> &RunTarget {
        &self.target
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub const fn summary(&self) -> &UploadSummary {
        &self.summary
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    #[must_use]
    pub const fn final_attempted(&self) -> bool {
        self.final_attempted
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    #[must_use]
    pub fn stream_offsets(&self) -> BTreeMap<String, u64> {
        self.batcher.offsets()
    }

    /// Queue one log entry.
    pub fn ingest(&mut self, envelope: &Envelope) -> Option<Control> {
        let control = self.batcher.push(envelope);
        match control {
            Some(Control::Preempting) => self.preempting_pending = true,
            Some(Control::Exit(code)) => {
                self.exit_code = Some(code);
                self.summary.exit_code = Some(code);
            }
            None => {}
        }
        control
    }

    /// Rebuild merged state from an already-delivered entry.
    pub fn absorb(&mut self, envelope: &Envelope) {
        self.batcher.absorb(envelope);
    }

    /// Effective batching window at `now_ms`.
    #[must_use]
    pub fn pacing(&self, now_ms: u64) -> Duration {
        if !self.config.dynamic_limits {
            return self.config.batch_window;
        }
        let age = Duration::from_millis(now_ms.saturating_sub(self.started_at_ms));
        self.config
            .batch_window
            .max(run_age_pacing(self.heartbeat, age))
    }

    fn urgent(&self) -> bool {
        self.preempting_pending || (self.exit_code.is_some() && !self.final_attempted)
    }

    /// Whether a live session should post now.
    #[must_use]
    pub fn flush_due(&self, now: Instant, now_ms: u64) -> bool {
        self.urgent()
            || (self.batcher.has_pending()
                && now.saturating_duration_since(self.last_post) >= self.pacing(now_ms))
    }

    #[must_use]
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        !self.final_attempted
            && !self.batcher.has_pending()
            && now.saturating_duration_since(self.last_post) >= self.heartbeat
    }

    /// Post everything pending, ignoring the batching window.
    pub async fn flush(&mut self) -> Result<FlushOutcome, UploadError> {
        let final_request = self.exit_code.is_some() && !self.final_attempted;
        let preempting = self.preempting_pending;
        if !self.batcher.has_pending() && !final_request && !preempting {
            return Ok(FlushOutcome::Idle);
        }

        let mut request = self.batcher.take_request(self.summary.dropped_chunks);
        if preempting {
            request.preempting = Some(true);
        }
        if final_request {
            request.complete = Some(true);
            request.exitcode = self.exit_code;
        }
        self.summary.oversized_lines = self.batcher.stats().oversized_lines;

        let mut outcome = FlushOutcome::Delivered;
        for part in split_request(request, self.config.max_request_bytes) {
            if !self.post(&part).await? {
                outcome = FlushOutcome::Dropped;
            }
        }

        self.preempting_pending = false;
        if final_request {
            self.final_attempted = true;
            self.summary.complete = outcome == FlushOutcome::Delivered;
        }
        Ok(outcome)
    }

    /// Deliver one request with retry. `Ok(false)` means it was dropped.
    async fn post(&mut self, request: &FileStreamRequest) -> Result<bool, UploadError> {
        let lines = request.line_count();
        let bytes = request.encoded_len() as u64;
        let transport = &self.transport;
        let target = &self.target;
        let outcome = with_retry_outcome(&self.config.retry, || {
            transport.post_file_stream(target, request)
        })
        .await;

        self.summary.requests += u64::from(outcome.attempts);
        self.summary.retries += u64::from(outcome.retries());
        self.last_post = Instant::now();

        match outcome.result {
            Ok(response) => {
                self.summary.bytes_sent += bytes;
                self.summary.lines_sent += lines as u64;
                self.apply_response(&response);
                debug!(
                    run_id = %self.target.run_id,
                    lines,
                    bytes,
                    attempts = outcome.attempts,
                    "file stream request acknowledged"
                );
                Ok(true)
            }
            Err(source) => match self.drop_policy {
                DropPolicy::StopAtFailure => Err(UploadError::Delivery {
                    attempts: outcome.attempts,
                    lines,
                    source,
                }),
                DropPolicy::AdvancePastDropped => {
                    self.summary.dropped_chunks += 1;
                    warn!(
                        run_id = %self.target.run_id,
                        lines,
                        attempts = outcome.attempts,
                        status = ?source.status(),
                        dropped = self.summary.dropped_chunks,
                        error = %source,
                        "dropping file stream chunk after failed delivery"
                    );
                    Ok(false)
                }
            },
        }
    }

    /// Post an empty keep-alive request. Failures are logged, not retried.
    pub async fn heartbeat(&mut self) {
        let request = FileStreamRequest::heartbeat(self.summary.dropped_chunks);
        self.summary.requests += 1;
        self.summary.heartbeats += 1;
        self.last_post = Instant::now();
        match self
            .transport
            .post_file_stream(&self.target, &request)
            .await
        {
            Ok(response) => self.apply_response(&response),
            Err(err) => {
                debug!(run_id = %self.target.run_id, error = %err, "heartbeat failed");
            }
        }
    }

    fn apply_response(&mut self, response: &FileStreamResponse) {
        if !self.config.dynamic_limits {
            return;
        }
        let Some(secs) = response
            .limits
            .as_ref()
            .and_then(|limits| limits.heartbeat_seconds)
        else {
            return;
        };
        if !secs.is_finite() || secs <= 0.0 {
            return;
        }
        let heartbeat = Duration::from_secs_f64(secs);
        if heartbeat != self.heartbeat {
            info!(
                run_id = %self.target.run_id,
                heartbeat_secs = secs,
                "server updated heartbeat interval"
            );
            self.heartbeat = heartbeat;
        }
    }

    #[must_use]
    pub fn into_summary(self) -> UploadSummary {
        self.summary
    }
}

/// A [`StreamUploader`] bound to a log on disk and a checkpoint consumer.
pub struct UploadSession<T> {
    log_dir: PathBuf,
    reader: TxLogReader,
    store: MetaStore,
    consumer: String,
    uploader: StreamUploader<T>,
    position: u64,
    committed: u64,
    max_entries: usize,
    poll_interval: Duration,
    offline_hint_logged: bool,
}

impl<T> std::fmt::Debug for UploadSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("log_dir", &self.log_dir)
            .field("consumer", &self.consumer)
            .field("position", &self.position)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

/// Where a session without a checkpoint starts numbering lines.
pub type InitialOffsets = BTreeMap<String, u64>;

impl<T: Transport> UploadSession<T> {
    /// Open the log and metadata store in `log_dir` and position the session
    /// at `consumer`'s checkpoint (or at the first entry).
    pub fn open(
        log_dir: impl AsRef<Path>,
        transport: T,
        target: RunTarget,
        config: UploadConfig,
        consumer: impl Into<String>,
        drop_policy: DropPolicy,
        initial_offsets: Option<InitialOffsets>,
    ) -> Result<Self, UploadError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        let consumer = consumer.into();
        let reader = TxLogReader::open(log_dir.join(LOG_FILE_NAME))?;
        let store = MetaStore::open(&log_dir)?;
        let checkpoint = store.load_checkpoint(&consumer)?;
        let started_at_ms = store
            .run_info()?
            .map_or_else(epoch_ms_now, |info| info.started_at_ms);

        let (position, offsets) = match &checkpoint {
            Some(cp) => (cp.log_offset.max(FILE_HEADER_LEN), cp.stream_offsets.clone()),
            None => (FILE_HEADER_LEN, initial_offsets.unwrap_or_default()),
        };

        let batcher = StreamBatcher::new(started_at_ms, config.max_line_bytes).with_offsets(&offsets);
        let max_entries = config.max_entries_per_flush.max(1);
        let poll_interval = config.poll_interval;
        let mut uploader =
            StreamUploader::new(transport, target, config, batcher, started_at_ms, drop_policy);
        if let Some(cp) = &checkpoint {
            uploader.resume_from(cp.dropped_chunks, cp.complete);
        }

        let mut session = Self {
            log_dir,
            reader,
            store,
            consumer,
            uploader,
            position,
            committed: position,
            max_entries,
            poll_interval,
            offline_hint_logged: false,
        };
        session.rebuild_state()?;
        session.uploader.summary.acked_offset = position;

        debug!(
            run_id = %session.uploader.target.run_id,
            consumer = %session.consumer,
            offset = position,
            resumed = checkpoint.is_some(),
            "upload session opened"
        );
        Ok(session)
    }

    /// Re-read delivered entries so merged summary and config survive a
    /// restart.
    fn rebuild_state(&mut self) -> Result<(), UploadError> {
        if self.position <= FILE_HEADER_LEN {
            return Ok(());
        }
        for entry in self.reader.read_from(FILE_HEADER_LEN)? {
            match entry {
                Ok(entry) if entry.offset < self.position => {
                    if let Ok(envelope) = entry.decode() {
                        self.uploader.absorb(&envelope);
                    }
                }
                Ok(_) => break,
                Err(err) if err.is_entry_local() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub const fn uploader(&self) -> &StreamUploader<T> {
        &self.uploader
    }

    #[must_use]
    pub fn summary(&self) -> UploadSummary {
        self.uploader.summary.clone()
    }

    /// Read up to one batch of new entries into the uploader.
    ///
    /// Returns the number of entries consumed, corrupt ones included.
    pub fn poll_log(&mut self) -> Result<usize, UploadError> {
        let mut entries = self.reader.read_from(self.position)?;
        let mut consumed = 0usize;
        while consumed < self.max_entries {
            match entries.next() {
                None => break,
                Some(Ok(entry)) => {
                    match entry.decode() {
                        Ok(envelope) => {
                            self.uploader.ingest(&envelope);
                        }
                        Err(err) => self.note_corrupt(&err),
                    }
                    consumed += 1;
                }
                Some(Err(err)) if err.is_entry_local() => {
                    self.note_corrupt(&err);
                    consumed += 1;
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
        self.position = entries.position();
        Ok(consumed)
    }

    fn note_corrupt(&mut self, err: &TxLogError) {
        self.uploader.summary.corrupt_entries += 1;
        warn!(
            run_id = %self.uploader.target.run_id,
            error = %err,
            "skipping unreadable log entry"
        );
    }

    /// Post everything read so far and commit the checkpoint.
    pub async fn flush(&mut self) -> Result<FlushOutcome, UploadError> {
        let outcome = self.uploader.flush().await?;
        if outcome == FlushOutcome::Dropped && !self.offline_hint_logged {
            self.offline_hint_logged = true;
            warn!(
                log_dir = %self.log_dir.display(),
                "some data could not be uploaded; it is kept locally, run `runsync sync {}` to retry",
                self.log_dir.display()
            );
        }
        if outcome != FlushOutcome::Idle || self.position != self.committed {
            self.commit()?;
        }
        Ok(outcome)
    }

    fn commit(&mut self) -> Result<(), UploadError> {
        let checkpoint = UploadCheckpoint {
            log_offset: self.position,
            stream_offsets: self.uploader.stream_offsets(),
            dropped_chunks: self.uploader.summary.dropped_chunks,
            complete: self.uploader.summary.complete,
            updated_at_ms: epoch_ms_now(),
        };
        self.store.commit_checkpoint(&self.consumer, &checkpoint)?;
        self.committed = self.position;
        self.uploader.summary.acked_offset = self.position;
        debug!(
            consumer = %self.consumer,
            offset = self.position,
            dropped = checkpoint.dropped_chunks,
            "upload checkpoint committed"
        );
        Ok(())
    }

    /// Upload every available entry, batch by batch, without pacing.
    pub async fn drain_to_end(&mut self) -> Result<UploadSummary, UploadError> {
        loop {
            let consumed = self.poll_log()?;
            self.flush().await?;
            if consumed < self.max_entries {
                break;
            }
        }
        Ok(self.summary())
    }

    /// Tail the log until shutdown or until the final request went out.
    ///
    /// `watermark` carries the writer's latest offset and only serves as a
    /// wake-up; the log itself is the source of truth.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut watermark: watch::Receiver<u64>,
    ) -> Result<UploadSummary, UploadError> {
        let mut watermark_open = true;
        let mut stopping = *shutdown.borrow();
        loop {
            self.poll_log()?;
            let now = Instant::now();
            if self.uploader.flush_due(now, epoch_ms_now()) {
                self.flush().await?;
            } else if self.uploader.heartbeat_due(now) {
                self.uploader.heartbeat().await;
            }

            if self.uploader.final_attempted() {
                break;
            }
            if stopping {
                self.drain_to_end().await?;
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }
                changed = watermark.changed(), if watermark_open => {
                    watermark_open = changed.is_ok();
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        let summary = self.summary();
        info!(
            run_id = %self.uploader.target.run_id,
            requests = summary.requests,
            retries = summary.retries,
            bytes = summary.bytes_sent,
            dropped = summary.dropped_chunks,
            complete = summary.complete,
            "uploader finished"
        );
        Ok(summary)
    }
}
