//! Record pipeline: many producers, one log writer.
//!
//! Producers push [`Record`]s into a bounded crossbeam channel; a single
//! thread (`runsync-log-writer`) owns the [`TxLogWriter`], stamps each record
//! into an [`Envelope`] and appends it. The writer also enforces run policy:
//!
//! - records arriving after the exit record are dropped and counted,
//! - a summary identical to the previous one is coalesced,
//! - lifecycle records drive the shared [`RunLifecycle`] state machine, and
//!   lifecycle records that do not change the state are not written.
//!
//! Overrun handling is explicit per record kind. Best-effort kinds are dropped
//! (and counted) when the queue is full; every other kind blocks for up to
//! `enqueue_timeout` and then fails with [`PipelineError::Backpressure`].
//!
//! A failed log write is fatal: the writer stops, and every later `enqueue`
//! or [`RunWriter::finish`] reports [`PipelineError::Fatal`].
//!
//! [`RunLifecycle`]: crate::run_state::RunLifecycle

use crate::error::ErrorClass;
use crate::record::{
    Envelope, JsonObject, LifecycleSignal, ProducerId, Record, RecordKind, epoch_ms_now,
};
use crate::run_state::{RunEvent, RunState, SharedLifecycle};
use crate::txlog::{DurabilityPolicy, ENTRY_HEADER_LEN, TxLogError, TxLogWriter};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Pipeline tuning, usually built by [`crate::config::Settings::pipeline_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    /// How long a must-not-drop record may wait for queue space.
    pub enqueue_timeout: Duration,
    /// Kinds dropped (and counted) instead of blocking when the queue is full.
    pub best_effort_kinds: Vec<RecordKind>,
    pub coalesce_duplicate_summaries: bool,
    pub durability: DurabilityPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            enqueue_timeout: Duration::from_secs(5),
            best_effort_kinds: vec![RecordKind::Console],
            coalesce_duplicate_summaries: true,
            durability: DurabilityPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("log writer queue stayed full for {timeout_ms} ms")]
    Backpressure { timeout_ms: u64 },

    #[error("pipeline is closed")]
    Closed,

    #[error("log writer stopped after a fatal error: {message}")]
    Fatal { message: String },

    #[error(transparent)]
    Log(#[from] TxLogError),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PipelineError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Backpressure { .. } => ErrorClass::Race,
            Self::Closed => ErrorClass::Config,
            Self::Fatal { .. } => ErrorClass::Durability,
            Self::Log(err) => err.class(),
            Self::Encode(_) => ErrorClass::Corruption,
        }
    }
}

/// Destination of the writer thread.
///
/// [`TxLogWriter`] is the production sink; tests substitute failing ones.
pub trait LogSink: Send + 'static {
    fn append(&mut self, payload: &[u8]) -> Result<u64, TxLogError>;
    fn sync(&mut self) -> Result<(), TxLogError>;
    fn next_offset(&self) -> u64;
    /// Entries already present when the sink was opened.
    fn entry_count(&self) -> u64;
}

impl LogSink for TxLogWriter {
    fn append(&mut self, payload: &[u8]) -> Result<u64, TxLogError> {
        Self::append(self, payload)
    }

    fn sync(&mut self) -> Result<(), TxLogError> {
        Self::sync(self)
    }

    fn next_offset(&self) -> u64 {
        Self::next_offset(self)
    }

    fn entry_count(&self) -> u64 {
        Self::entry_count(self)
    }
}

/// Counters for one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub written: u64,
    pub dropped_best_effort: u64,
    pub dropped_after_exit: u64,
    pub dropped_oversized: u64,
    pub coalesced_summaries: u64,
    /// Lifecycle records that did not change the run state.
    pub lifecycle_noops: u64,
    pub bytes_written: u64,
    /// Log offset just past the last written entry.
    pub last_offset: u64,
}

impl PipelineStats {
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped_best_effort + self.dropped_after_exit + self.dropped_oversized
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped_best_effort: AtomicU64,
    dropped_after_exit: AtomicU64,
    dropped_oversized: AtomicU64,
    coalesced_summaries: AtomicU64,
    lifecycle_noops: AtomicU64,
    bytes_written: AtomicU64,
    last_offset: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    counters: Counters,
    fatal: Mutex<Option<String>>,
    closed: AtomicBool,
    /// Set when the writer thread has exited.
    stopped: AtomicBool,
    next_producer: AtomicU32,
}

impl Shared {
    fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    fn set_fatal(&self, message: String) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(message);
        }
    }

    fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            dropped_best_effort: c.dropped_best_effort.load(Ordering::Relaxed),
            dropped_after_exit: c.dropped_after_exit.load(Ordering::Relaxed),
            dropped_oversized: c.dropped_oversized.load(Ordering::Relaxed),
            coalesced_summaries: c.coalesced_summaries.load(Ordering::Relaxed),
            lifecycle_noops: c.lifecycle_noops.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            last_offset: c.last_offset.load(Ordering::Relaxed),
        }
    }

    /// Error for a producer whose channel is gone.
    fn disconnected(&self) -> PipelineError {
        self.fatal()
            .map_or(PipelineError::Closed, |message| PipelineError::Fatal { message })
    }
}

#[derive(Debug)]
struct Pending {
    producer_id: ProducerId,
    producer_seq: u64,
    pid: u32,
    created_at_ms: u64,
    record: Record,
}

#[derive(Debug)]
enum Message {
    Record(Pending),
    /// Reply once everything queued before it is written; fsync if `sync`.
    Flush {
        sync: bool,
        reply: Sender<Result<u64, String>>,
    },
    Shutdown,
}

#[derive(Debug)]
struct ProducerPolicy {
    best_effort: Vec<RecordKind>,
    enqueue_timeout: Duration,
}

/// Creates [`Producer`] handles; cheap to clone and share across threads.
#[derive(Debug, Clone)]
pub struct ProducerFactory {
    tx: Sender<Message>,
    shared: Arc<Shared>,
    policy: Arc<ProducerPolicy>,
}

impl ProducerFactory {
    /// A producer attributed to this process.
    #[must_use]
    pub fn producer(&self) -> Producer {
        self.producer_for_pid(std::process::id())
    }

    /// A producer attributed to another process (IPC peers).
    #[must_use]
    pub fn producer_for_pid(&self, pid: u32) -> Producer {
        let id = self.shared.next_producer.fetch_add(1, Ordering::Relaxed);
        debug!(producer_id = id, pid, "producer registered");
        Producer {
            id,
            pid,
            next_seq: 0,
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            policy: Arc::clone(&self.policy),
        }
    }
}

/// One ordered stream of records into the log.
///
/// Records from the same producer reach the log in enqueue order. Use one
/// producer per thread.
#[derive(Debug)]
pub struct Producer {
    id: ProducerId,
    pid: u32,
    next_seq: u64,
    tx: Sender<Message>,
    shared: Arc<Shared>,
    policy: Arc<ProducerPolicy>,
}

impl Producer {
    #[must_use]
    pub const fn id(&self) -> ProducerId {
        self.id
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn enqueue(&mut self, record: Record) -> Result<(), PipelineError> {
        if let Some(message) = self.shared.fatal() {
            return Err(PipelineError::Fatal { message });
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }

        let kind = record.kind();
        let message = Message::Record(Pending {
            producer_id: self.id,
            producer_seq: self.next_seq,
            pid: self.pid,
            created_at_ms: epoch_ms_now(),
            record,
        });

        if self.policy.best_effort.contains(&kind) {
            match self.tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = self
                        .shared
                        .counters
                        .dropped_best_effort
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    if dropped.is_power_of_two() {
                        warn!(
                            producer_id = self.id,
                            kind = %kind,
                            dropped,
                            "log queue full; dropping best-effort records"
                        );
                    }
                    return Ok(());
                }
                Err(TrySendError::Disconnected(_)) => return Err(self.shared.disconnected()),
            }
        } else {
            match self.tx.send_timeout(message, self.policy.enqueue_timeout) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    let timeout_ms = self.policy.enqueue_timeout.as_millis() as u64;
                    warn!(producer_id = self.id, kind = %kind, timeout_ms, "log queue full");
                    return Err(PipelineError::Backpressure { timeout_ms });
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(self.shared.disconnected()),
            }
        }

        self.next_seq += 1;
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until everything this producer enqueued has been written.
    /// Returns the log offset at that point.
    pub fn barrier(&self) -> Result<u64, PipelineError> {
        round_trip(&self.tx, &self.shared, false)
    }
}

const REPLY_POLL: Duration = Duration::from_millis(100);

fn round_trip(tx: &Sender<Message>, shared: &Shared, sync: bool) -> Result<u64, PipelineError> {
    if shared.stopped.load(Ordering::Acquire) {
        return Err(shared.disconnected());
    }
    let (reply, response) = channel::bounded(1);
    tx.send(Message::Flush { sync, reply })
        .map_err(|_| shared.disconnected())?;
    loop {
        match response.recv_timeout(REPLY_POLL) {
            Ok(Ok(offset)) => return Ok(offset),
            Ok(Err(message)) => return Err(PipelineError::Fatal { message }),
            Err(channel::RecvTimeoutError::Timeout) => {
                // A stopped writer never answers requests left in the queue.
                if shared.stopped.load(Ordering::Acquire) {
                    return Err(shared.disconnected());
                }
            }
            Err(channel::RecvTimeoutError::Disconnected) => return Err(shared.disconnected()),
        }
    }
}

/// Owner of the log writer thread.
#[derive(Debug)]
pub struct RunWriter {
    tx: Sender<Message>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    factory: ProducerFactory,
    lifecycle: Arc<SharedLifecycle>,
}

impl RunWriter {
    /// Open (or recover) the log at `log_path` and start the writer thread.
    pub fn start(
        log_path: impl AsRef<Path>,
        config: &PipelineConfig,
        lifecycle: Arc<SharedLifecycle>,
        watermark: Option<watch::Sender<u64>>,
    ) -> Result<Self, PipelineError> {
        let log = TxLogWriter::open(log_path.as_ref(), config.durability)?;
        let recovery = log.recovery();
        if recovery.truncated_bytes > 0 {
            warn!(
                path = %log_path.as_ref().display(),
                truncated_bytes = recovery.truncated_bytes,
                "recovered run log with a torn tail"
            );
        }
        Self::start_with_sink(log, config, lifecycle, watermark)
    }

    /// Start the writer thread over an arbitrary sink.
    pub fn start_with_sink<S: LogSink>(
        sink: S,
        config: &PipelineConfig,
        lifecycle: Arc<SharedLifecycle>,
        watermark: Option<watch::Sender<u64>>,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = channel::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared::default());
        shared
            .counters
            .last_offset
            .store(sink.next_offset(), Ordering::Relaxed);

        let worker = Worker {
            sink,
            rx,
            shared: Arc::clone(&shared),
            lifecycle: Arc::clone(&lifecycle),
            watermark,
            coalesce: config.coalesce_duplicate_summaries,
            last_summary: None,
            exited: lifecycle.state() == RunState::Finished,
        };
        let handle = std::thread::Builder::new()
            .name("runsync-log-writer".to_string())
            .spawn(move || worker.run())
            .map_err(|e| PipelineError::Fatal {
                message: format!("failed to spawn log writer: {e}"),
            })?;

        let factory = ProducerFactory {
            tx: tx.clone(),
            shared: Arc::clone(&shared),
            policy: Arc::new(ProducerPolicy {
                best_effort: config.best_effort_kinds.clone(),
                enqueue_timeout: config.enqueue_timeout,
            }),
        };

        Ok(Self {
            tx,
            handle: Some(handle),
            shared,
            factory,
            lifecycle,
        })
    }

    #[must_use]
    pub fn producer(&self) -> Producer {
        self.factory.producer()
    }

    #[must_use]
    pub fn factory(&self) -> ProducerFactory {
        self.factory.clone()
    }

    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<SharedLifecycle> {
        &self.lifecycle
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    /// Error that stopped the writer, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal()
    }

    /// Write and fsync everything queued so far.
    pub fn flush(&self) -> Result<u64, PipelineError> {
        round_trip(&self.tx, &self.shared, true)
    }

    /// Record the exit, drain the queue and stop the writer.
    ///
    /// The exit record waits for queue space without a timeout.
    pub fn finish(self, exit_code: i32) -> Result<PipelineStats, PipelineError> {
        if self.shared.fatal().is_none() && !self.shared.closed.load(Ordering::Acquire) {
            let producer = self.factory.producer();
            let exit = Message::Record(Pending {
                producer_id: producer.id,
                producer_seq: 0,
                pid: producer.pid,
                created_at_ms: epoch_ms_now(),
                record: Record::lifecycle(LifecycleSignal::Exit { exit_code }),
            });
            if self.tx.send(exit).is_ok() {
                self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shutdown()
    }

    /// Drain the queue and stop the writer without recording an exit.
    pub fn shutdown(mut self) -> Result<PipelineStats, PipelineError> {
        self.stop();
        let stats = self.shared.stats();
        match self.shared.fatal() {
            Some(message) => Err(PipelineError::Fatal { message }),
            None => Ok(stats),
        }
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.tx.send(Message::Shutdown);
        if handle.join().is_err() {
            self.shared.set_fatal("log writer thread panicked".to_string());
        }
    }
}

impl Drop for RunWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<S> {
    sink: S,
    rx: Receiver<Message>,
    shared: Arc<Shared>,
    lifecycle: Arc<SharedLifecycle>,
    watermark: Option<watch::Sender<u64>>,
    coalesce: bool,
    last_summary: Option<JsonObject>,
    exited: bool,
}

impl<S: LogSink> Worker<S> {
    fn run(mut self) {
        let mut seq = self.sink.entry_count();
        while let Ok(message) = self.rx.recv() {
            match message {
                Message::Record(pending) => {
                    if !self.write(pending, &mut seq) {
                        break;
                    }
                }
                Message::Flush { sync, reply } => {
                    let result = if sync {
                        self.sink.sync().map_err(|e| self.fail(&e))
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(result.map(|()| self.sink.next_offset()));
                }
                Message::Shutdown => {
                    // Late records are past the exit; count them.
                    while let Ok(message) = self.rx.try_recv() {
                        match message {
                            Message::Record(pending) => {
                                if !self.write(pending, &mut seq) {
                                    break;
                                }
                            }
                            Message::Flush { reply, .. } => {
                                let _ = reply.send(Ok(self.sink.next_offset()));
                            }
                            Message::Shutdown => {}
                        }
                    }
                    break;
                }
            }
        }

        if self.shared.fatal().is_none() {
            if let Err(e) = self.sink.sync() {
                self.fail(&e);
            }
        }
        self.publish_offset();
        self.shared.stopped.store(true, Ordering::Release);
        debug!(written = seq, "log writer stopped");
    }

    /// Returns false once the writer must stop.
    fn write(&mut self, pending: Pending, seq: &mut u64) -> bool {
        let counters = &self.shared.counters;
        if self.exited {
            counters.dropped_after_exit.fetch_add(1, Ordering::Relaxed);
            debug!(producer_id = pending.producer_id, "dropping record after exit");
            return true;
        }

        let mut transition = None;
        let mut written_summary = None;
        match &pending.record {
            Record::Summary { values } if self.coalesce => {
                if self.last_summary.as_ref() == Some(values) {
                    counters.coalesced_summaries.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                written_summary = Some(values.clone());
            }
            Record::Lifecycle { signal } => {
                let t = self
                    .lifecycle
                    .apply(RunEvent::from(*signal), pending.created_at_ms);
                if !t.changed {
                    counters.lifecycle_noops.fetch_add(1, Ordering::Relaxed);
                    debug!(event = ?t.event, state = %t.to, "lifecycle record did not change state");
                    return true;
                }
                transition = Some(t);
            }
            _ => {}
        }

        let envelope = Envelope {
            seq: *seq,
            producer_id: pending.producer_id,
            producer_seq: pending.producer_seq,
            pid: pending.pid,
            created_at_ms: pending.created_at_ms,
            record: pending.record,
        };
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(producer_id = envelope.producer_id, error = %e, "failed to encode record");
                counters.dropped_oversized.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        match self.sink.append(&payload) {
            Ok(offset) => {
                *seq += 1;
                if written_summary.is_some() {
                    self.last_summary = written_summary;
                }
                counters.written.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_written
                    .fetch_add(payload.len() as u64 + ENTRY_HEADER_LEN, Ordering::Relaxed);
                tracing::trace!(offset, seq = envelope.seq, kind = %envelope.record.kind(), "record written");
            }
            Err(TxLogError::EntryTooLarge { len, max }) => {
                counters.dropped_oversized.fetch_add(1, Ordering::Relaxed);
                error!(
                    producer_id = envelope.producer_id,
                    bytes = len,
                    max_bytes = max,
                    "record exceeds the log entry limit; dropping it"
                );
                return true;
            }
            Err(e) => {
                self.fail(&e);
                return false;
            }
        }

        if let Some(t) = transition {
            debug!(from = %t.from, to = %t.to, "run state changed");
            if t.to == RunState::Finished {
                self.exited = true;
                if let Err(e) = self.sink.sync() {
                    self.fail(&e);
                    return false;
                }
            }
        }
        self.publish_offset();
        true
    }

    fn publish_offset(&self) {
        let offset = self.sink.next_offset();
        self.shared
            .counters
            .last_offset
            .store(offset, Ordering::Relaxed);
        if let Some(watermark) = &self.watermark {
            watermark.send_replace(offset);
        }
    }

    fn fail(&self, err: &TxLogError) -> String {
        let message = err.to_string();
        error!(error = %err, class = %err.class(), "run log write failed; stopping the writer");
        self.shared.set_fatal(message.clone());
        message
    }
}
