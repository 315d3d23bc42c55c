//! Offline sync: push a local run log through the upload path later.
//!
//! The log is only read. Progress per backend target is kept in the run's
//! metadata store as a checkpoint named `sync:<entity>/<project>/<run_id>`,
//! so syncing twice sends nothing new and an interrupted sync resumes where
//! the backend last acknowledged.

use crate::error::ErrorClass;
use crate::file_stream::StreamName;
use crate::meta_store::{META_DB_NAME, MetaStore, MetaStoreError, UploadCheckpoint, sync_marker_name};
use crate::record::{RecordKind, epoch_ms_now};
use crate::retry::{RetryPolicy, with_retry_outcome};
use crate::run::RunTarget;
use crate::transport::{Transport, TransportError};
use crate::txlog::{FILE_HEADER_LEN, LOG_FILE_NAME, TxLogError, TxLogReader};
use crate::uploader::{DropPolicy, InitialOffsets, UploadConfig, UploadError, UploadSession, UploadSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How line offsets are numbered on the target run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Number lines from this log's own checkpoint (zero for a new target).
    #[default]
    Overwrite,
    /// Continue after the lines the backend already holds for the target.
    Append,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Upload to this run instead of the one recorded in the log directory.
    pub target: Option<RunTarget>,
    pub upload: UploadConfig,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no run log at {}", path.display())]
    MissingLog { path: PathBuf },

    #[error("no run target recorded in {}; pass entity, project and run id", log_dir.display())]
    UnknownTarget { log_dir: PathBuf },

    #[error("could not query resume state after {attempts} attempts: {source}")]
    ResumeQuery {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Meta(#[from] MetaStoreError),

    #[error(transparent)]
    Log(#[from] TxLogError),
}

impl SyncError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingLog { .. } | Self::UnknownTarget { .. } => ErrorClass::Config,
            Self::ResumeQuery { .. } => ErrorClass::Transport,
            Self::Upload(err) => err.class(),
            Self::Meta(err) => err.class(),
            Self::Log(err) => err.class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub target: RunTarget,
    pub mode: SyncMode,
    /// Log bytes consumed by this sync.
    pub new_bytes: u64,
    pub entries_replayed: u64,
    /// Chunks dropped over the life of this target's marker.
    pub chunks_dropped: u64,
    /// The log ends with an exit record.
    pub log_complete: bool,
    /// Nothing was left to send.
    pub already_synced: bool,
    pub upload: UploadSummary,
}

impl SyncSummary {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.chunks_dropped == 0
    }
}

/// Upload everything in `log_dir` the target has not acknowledged yet.
pub async fn sync<T: Transport>(
    log_dir: impl AsRef<Path>,
    transport: T,
    options: SyncOptions,
) -> Result<SyncSummary, SyncError> {
    let log_dir = log_dir.as_ref();
    let log_path = log_dir.join(LOG_FILE_NAME);
    if !log_path.is_file() {
        return Err(SyncError::MissingLog { path: log_path });
    }

    let (target, marker) = {
        let store = MetaStore::open(log_dir)?;
        let target = match options.target {
            Some(target) => target,
            None => store
                .run_info()?
                .map(|info| RunTarget::from(&info))
                .ok_or_else(|| SyncError::UnknownTarget {
                    log_dir: log_dir.to_path_buf(),
                })?,
        };
        let marker = store.load_checkpoint(&sync_marker_name(&target.key()))?;
        (target, marker)
    };
    let consumer = sync_marker_name(&target.key());

    let initial_offsets = match (&marker, options.mode) {
        (None, SyncMode::Append) => {
            let offsets = query_resume_offsets(&transport, &target).await?;
            pin_resume_offsets(log_dir, &consumer, &offsets)?;
            Some(offsets)
        }
        _ => None,
    };

    let mut session = UploadSession::open(
        log_dir,
        transport,
        target.clone(),
        options.upload,
        consumer,
        DropPolicy::StopAtFailure,
        initial_offsets,
    )?;
    let start = session.position();
    info!(
        run_id = %target.run_id,
        log_dir = %log_dir.display(),
        mode = ?options.mode,
        offset = start,
        resumed = marker.is_some(),
        "sync started"
    );

    let upload = session.drain_to_end().await?;
    let end = session.position();
    let log_complete = upload.complete || session.uploader().exit_code().is_some();
    let entries_replayed = count_entries(&log_path, start, end)?;

    let summary = SyncSummary {
        target,
        mode: options.mode,
        new_bytes: end.saturating_sub(start),
        entries_replayed,
        chunks_dropped: upload.dropped_chunks,
        log_complete,
        already_synced: end == start && upload.requests == 0,
        upload,
    };

    if !summary.log_complete {
        warn!(
            run_id = %summary.target.run_id,
            log_dir = %log_dir.display(),
            "run log has no exit record yet; sync again once the run finishes"
        );
    }
    info!(
        run_id = %summary.target.run_id,
        new_bytes = summary.new_bytes,
        entries = summary.entries_replayed,
        requests = summary.upload.requests,
        dropped = summary.chunks_dropped,
        "sync finished"
    );
    Ok(summary)
}

async fn query_resume_offsets<T: Transport>(
    transport: &T,
    target: &RunTarget,
) -> Result<InitialOffsets, SyncError> {
    let outcome = with_retry_outcome(&RetryPolicy::query(), || transport.resume_state(target)).await;
    let state = outcome.result.map_err(|source| SyncError::ResumeQuery {
        attempts: outcome.attempts,
        source,
    })?;
    debug!(
        run_id = %target.run_id,
        history = state.history_line_count,
        events = state.events_line_count,
        output = state.output_line_count,
        "resuming line numbering from backend"
    );
    Ok(BTreeMap::from([
        (StreamName::History.file_name().to_string(), state.history_line_count),
        (StreamName::Events.file_name().to_string(), state.events_line_count),
        (StreamName::Output.file_name().to_string(), state.output_line_count),
    ]))
}

/// Record the backend's line counts as the marker's starting point.
///
/// A sync that fails part way resumes from this marker, so the backend is
/// never asked again after it has received some of this log's lines.
fn pin_resume_offsets(
    log_dir: &Path,
    consumer: &str,
    offsets: &InitialOffsets,
) -> Result<(), MetaStoreError> {
    let checkpoint = UploadCheckpoint {
        log_offset: FILE_HEADER_LEN,
        stream_offsets: offsets.clone(),
        dropped_chunks: 0,
        complete: false,
        updated_at_ms: epoch_ms_now(),
    };
    MetaStore::open(log_dir)?.commit_checkpoint(consumer, &checkpoint)
}

fn count_entries(path: &Path, start: u64, end: u64) -> Result<u64, TxLogError> {
    if end <= start {
        return Ok(0);
    }
    let mut count = 0;
    for entry in TxLogReader::open(path)?.read_from(start)? {
        match entry {
            Ok(entry) if entry.offset >= end => break,
            Ok(_) => count += 1,
            Err(err) if err.is_entry_local() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(count)
}

/// What `runsync inspect` reports about a run directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogInspection {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Offset just past the last readable entry.
    pub valid_bytes: u64,
    pub entries: u64,
    pub corrupt_entries: u64,
    pub corrupt_bytes: u64,
    pub undecodable_entries: u64,
    pub kinds: BTreeMap<RecordKind, u64>,
    pub producers: u64,
    pub complete: bool,
    pub exit_code: Option<i32>,
    pub target: Option<RunTarget>,
    pub started_at_ms: Option<u64>,
    pub checkpoints: BTreeMap<String, UploadCheckpoint>,
}

impl LogInspection {
    /// Bytes after the last readable entry (torn or still being written).
    #[must_use]
    pub const fn trailing_bytes(&self) -> u64 {
        self.size_bytes.saturating_sub(self.valid_bytes)
    }
}

/// Scan a run directory without modifying it.
pub fn inspect(log_dir: impl AsRef<Path>) -> Result<LogInspection, SyncError> {
    let log_dir = log_dir.as_ref();
    let path = log_dir.join(LOG_FILE_NAME);
    if !path.is_file() {
        return Err(SyncError::MissingLog { path });
    }
    let reader = TxLogReader::open(&path)?;
    let mut report = LogInspection {
        size_bytes: reader.len()?,
        valid_bytes: FILE_HEADER_LEN,
        path,
        ..LogInspection::default()
    };

    let mut producers = std::collections::BTreeSet::new();
    let mut entries = reader.read_from(FILE_HEADER_LEN)?;
    for entry in entries.by_ref() {
        match entry {
            Ok(entry) => match entry.decode() {
                Ok(envelope) => {
                    report.entries += 1;
                    *report.kinds.entry(envelope.record.kind()).or_default() += 1;
                    producers.insert((envelope.pid, envelope.producer_id));
                    if let Some(code) = envelope.record.exit_code() {
                        report.complete = true;
                        report.exit_code = Some(code);
                    }
                }
                Err(err) => {
                    report.undecodable_entries += 1;
                    debug!(offset = entry.offset, error = %err, "undecodable entry");
                }
            },
            Err(TxLogError::Corrupt { offset, skipped, reason }) => {
                report.corrupt_entries += 1;
                report.corrupt_bytes += skipped;
                debug!(offset, skipped, reason, "corrupt span");
            }
            Err(err) => return Err(err.into()),
        }
    }
    report.valid_bytes = entries.position();
    report.producers = producers.len() as u64;

    if log_dir.join(META_DB_NAME).is_file() {
        let store = MetaStore::open(log_dir)?;
        if let Some(info) = store.run_info()? {
            report.target = Some(RunTarget::from(&info));
            report.started_at_ms = Some(info.started_at_ms);
        }
        report.checkpoints = store.checkpoints()?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_store::StoredRunInfo;
    use crate::record::{Envelope, LifecycleSignal, Record};
    use crate::transport::ScriptedTransport;
    use crate::txlog::{DurabilityPolicy, TxLogWriter};
    use serde_json::json;
    use std::sync::Arc;

    fn write_log(dir: &Path, records: Vec<Record>) {
        let mut writer =
            TxLogWriter::open(dir.join(LOG_FILE_NAME), DurabilityPolicy::EveryWrite).unwrap();
        let seq0 = writer.entry_count();
        for (i, record) in records.into_iter().enumerate() {
            let env = Envelope {
                seq: seq0 + i as u64,
                producer_id: 0,
                producer_seq: seq0 + i as u64,
                pid: 1,
                created_at_ms: 1_700_000_000_000 + i as u64,
                record,
            };
            writer.append(&env.encode().unwrap()).unwrap();
        }
        writer.sync().unwrap();
    }

    fn record_target(dir: &Path) {
        MetaStore::open(dir)
            .unwrap()
            .record_run_info(&StoredRunInfo {
                entity: "acme".into(),
                project: "vision".into(),
                run_id: "offline-1".into(),
                started_at_ms: 1_700_000_000_000,
                format_version: 1,
            })
            .unwrap();
    }

    fn metrics(range: std::ops::Range<u64>) -> Vec<Record> {
        range
            .map(|step| Record::metric(Some(step), json!({"loss": step})).unwrap())
            .collect()
    }

    fn exit() -> Record {
        Record::lifecycle(LifecycleSignal::Exit { exit_code: 0 })
    }

    #[tokio::test]
    async fn second_sync_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = metrics(0..4);
        records.push(exit());
        write_log(dir.path(), records);
        record_target(dir.path());

        let transport = Arc::new(ScriptedTransport::new());
        let first = sync(dir.path(), Arc::clone(&transport), SyncOptions::default())
            .await
            .unwrap();
        assert!(first.new_bytes > 0);
        assert_eq!(first.entries_replayed, 5);
        assert!(first.log_complete);
        assert_eq!(first.target.run_id, "offline-1");
        let sent = transport.request_count();

        let second = sync(dir.path(), Arc::clone(&transport), SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(second.new_bytes, 0);
        assert!(second.already_synced);
        assert_eq!(transport.request_count(), sent);
    }

    #[tokio::test]
    async fn incomplete_log_syncs_prefix_then_rest() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), metrics(0..3));
        record_target(dir.path());

        let transport = Arc::new(ScriptedTransport::new());
        let first = sync(dir.path(), Arc::clone(&transport), SyncOptions::default())
            .await
            .unwrap();
        assert!(!first.log_complete);
        assert_eq!(transport.lines_for("history.jsonl").len(), 3);

        let mut rest = metrics(3..5);
        rest.push(exit());
        write_log(dir.path(), rest);
        let second = sync(dir.path(), Arc::clone(&transport), SyncOptions::default())
            .await
            .unwrap();
        assert!(second.log_complete);
        assert_eq!(second.entries_replayed, 3);
        let lines = transport.lines_for("history.jsonl");
        assert_eq!(lines.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn append_mode_continues_backend_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = metrics(0..2);
        records.push(exit());
        write_log(dir.path(), records);

        let transport = Arc::new(ScriptedTransport::new());
        transport.set_resume_state(crate::transport::ResumeState {
            history_line_count: 10,
            events_line_count: 2,
            output_line_count: 0,
        });
        let options = SyncOptions {
            mode: SyncMode::Append,
            target: Some(RunTarget::new("acme", "vision", "existing")),
            ..SyncOptions::default()
        };
        let summary = sync(dir.path(), Arc::clone(&transport), options.clone())
            .await
            .unwrap();
        assert_eq!(summary.target.run_id, "existing");
        assert_eq!(transport.resume_queries(), 1);
        let lines = transport.lines_for("history.jsonl");
        assert_eq!(lines.keys().copied().collect::<Vec<_>>(), vec![10, 11]);

        // The marker now exists; the backend is not asked again.
        sync(dir.path(), Arc::clone(&transport), options).await.unwrap();
        assert_eq!(transport.resume_queries(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_keeps_marker_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = metrics(0..3);
        records.push(exit());
        write_log(dir.path(), records);
        record_target(dir.path());

        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_with_status(403, 1);
        let err = sync(dir.path(), Arc::clone(&transport), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Upload(UploadError::Delivery { .. })));

        let inspection = inspect(dir.path()).unwrap();
        let marker = inspection
            .checkpoints
            .get("sync:acme/vision/offline-1")
            .cloned()
            .unwrap_or_default();
        assert!(!marker.complete);

        let summary = sync(dir.path(), Arc::clone(&transport), SyncOptions::default())
            .await
            .unwrap();
        assert!(summary.log_complete);
        assert_eq!(summary.chunks_dropped, 0);
        assert_eq!(transport.lines_for("history.jsonl").len(), 3);
    }

    #[tokio::test]
    async fn missing_target_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), metrics(0..1));
        let err = sync(dir.path(), ScriptedTransport::new(), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownTarget { .. }));
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[test]
    fn inspect_counts_kinds_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = metrics(0..3);
        records.push(Record::summary(json!({"acc": 1})).unwrap());
        records.push(Record::lifecycle(LifecycleSignal::Exit { exit_code: 2 }));
        write_log(dir.path(), records);
        record_target(dir.path());

        let report = inspect(dir.path()).unwrap();
        assert_eq!(report.entries, 5);
        assert_eq!(report.kinds[&RecordKind::Metric], 3);
        assert_eq!(report.kinds[&RecordKind::Summary], 1);
        assert!(report.complete);
        assert_eq!(report.exit_code, Some(2));
        assert_eq!(report.corrupt_entries, 0);
        assert_eq!(report.trailing_bytes(), 0);
        assert_eq!(report.producers, 1);
        assert_eq!(report.target.unwrap().run_id, "offline-1");
    }

    #[test]
    fn inspect_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            inspect(dir.path()),
            Err(SyncError::MissingLog { .. })
        ));
        assert!(!dir.path().join(META_DB_NAME).exists());
    }
}
