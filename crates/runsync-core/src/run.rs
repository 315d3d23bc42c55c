//! Run orchestration: one log writer, one optional live uploader.
//!
//! [`RunContext::start`] opens (or resumes) the run directory, starts the
//! pipeline writer thread and, unless the backend is unset, an uploader thread
//! that tails the log on a current-thread tokio runtime. Offline runs only
//! write the log; `runsync sync <dir>` uploads them later.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::interrupt::InterruptToken;
use crate::meta_store::{LIVE_UPLOADER, MetaStore, StoredRunInfo};
use crate::pipeline::{PipelineError, PipelineStats, Producer, ProducerFactory, RunWriter};
use crate::record::{LifecycleSignal, Record, epoch_ms_now};
use crate::run_state::{PauseWait, RunLifecycle, RunState, SharedLifecycle};
use crate::transport::{HttpTransport, Transport};
use crate::txlog::LOG_FILE_NAME;
use crate::uploader::{DropPolicy, UploadSession, UploadSummary};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Version of the on-disk run directory layout.
pub const RUN_FORMAT_VERSION: u8 = 1;

/// Backend identity of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunTarget {
    pub entity: String,
    pub project: String,
    pub run_id: String,
}

impl RunTarget {
    pub fn new(
        entity: impl Into<String>,
        project: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            project: project.into(),
            run_id: run_id.into(),
        }
    }

    /// `entity/project/run_id`; stable across processes.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.entity, self.project, self.run_id)
    }
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<&StoredRunInfo> for RunTarget {
    fn from(info: &StoredRunInfo) -> Self {
        Self::new(&info.entity, &info.project, &info.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub target: RunTarget,
    pub log_dir: PathBuf,
    pub started_at_ms: u64,
    /// No backend configured; nothing is uploaded live.
    pub offline: bool,
    /// The directory already held a log for this run.
    pub resumed: bool,
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub target: RunTarget,
    pub log_dir: PathBuf,
    pub exit_code: i32,
    pub pipeline: PipelineStats,
    /// `None` for offline runs.
    pub upload: Option<UploadSummary>,
}

impl RunOutcome {
    /// No record was dropped locally and every chunk reached the backend.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.pipeline.dropped() == 0
            && self
                .upload
                .as_ref()
                .is_none_or(|u| u.dropped_chunks == 0 && u.complete)
    }

    /// The log holds data the backend has not acknowledged.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.upload
            .as_ref()
            .is_none_or(|u| u.dropped_chunks > 0 || !u.complete)
    }
}

/// Control surface for pause, resume and preemption.
///
/// Transitions go through the log writer so they are recorded exactly once;
/// each call returns after the writer has applied it.
#[derive(Debug, Clone)]
pub struct RunHandle {
    producer: Arc<Mutex<Producer>>,
    lifecycle: Arc<SharedLifecycle>,
}

impl RunHandle {
    pub fn pause(&self) -> std::result::Result<RunState, PipelineError> {
        self.signal(LifecycleSignal::Pause)
    }

    pub fn resume(&self) -> std::result::Result<RunState, PipelineError> {
        self.signal(LifecycleSignal::Resume)
    }

    /// Tell the backend the run is about to be preempted.
    pub fn mark_preempting(&self) -> std::result::Result<RunState, PipelineError> {
        self.signal(LifecycleSignal::Preempting)
    }

    fn signal(&self, signal: LifecycleSignal) -> std::result::Result<RunState, PipelineError> {
        let mut producer = self.producer.lock();
        producer.enqueue(Record::lifecycle(signal))?;
        producer.barrier()?;
        Ok(self.lifecycle.state())
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    /// Run time so far, excluding paused time.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.lifecycle.snapshot().elapsed_ms(epoch_ms_now())
    }

    #[must_use]
    pub fn paused_ms(&self) -> u64 {
        self.lifecycle.snapshot().paused_ms(epoch_ms_now())
    }

    /// Block the calling thread while the run is paused.
    pub fn wait_while_paused(&self, token: &InterruptToken, timeout: Duration) -> PauseWait {
        self.lifecycle.wait_while_paused(token, timeout)
    }
}

type UploaderThread = JoinHandle<Result<UploadSummary>>;

/// A live run.
pub struct RunContext {
    info: RunInfo,
    writer: RunWriter,
    handle: RunHandle,
    shutdown: watch::Sender<bool>,
    uploader: Option<UploaderThread>,
    #[cfg(unix)]
    ipc: Option<crate::ipc::IpcServer>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("info", &self.info)
            .field("uploading", &self.uploader.is_some())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Start a run using the configured HTTP backend, or offline when
    /// `backend.base_url` is unset.
    pub fn start(settings: &Settings, log_dir: impl AsRef<Path>, target: RunTarget) -> Result<Self> {
        let transport = if settings.backend.is_offline() {
            None
        } else {
            Some(HttpTransport::new(&settings.backend)?)
        };
        Self::start_with_transport(settings, log_dir, target, transport)
    }

    /// Start a run with an explicit transport (`None` for offline).
    pub fn start_with_transport<T>(
        settings: &Settings,
        log_dir: impl AsRef<Path>,
        target: RunTarget,
        transport: Option<T>,
    ) -> Result<Self>
    where
        T: Transport + Send + 'static,
    {
        settings.validate()?;
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;

        let store = MetaStore::open(&log_dir)?;
        let (started_at_ms, resumed) = match store.run_info()? {
            Some(stored) => {
                if RunTarget::from(&stored) != target {
                    warn!(
                        log_dir = %log_dir.display(),
                        stored = %RunTarget::from(&stored),
                        run_id = %target.run_id,
                        "run directory belongs to another run; keeping its identity"
                    );
                }
                (stored.started_at_ms, true)
            }
            None => {
                let started_at_ms = epoch_ms_now();
                store.record_run_info(&StoredRunInfo {
                    entity: target.entity.clone(),
                    project: target.project.clone(),
                    run_id: target.run_id.clone(),
                    started_at_ms,
                    format_version: RUN_FORMAT_VERSION,
                })?;
                (started_at_ms, false)
            }
        };
        drop(store);

        let lifecycle = Arc::new(SharedLifecycle::new(RunLifecycle::new(started_at_ms)));
        let (watermark_tx, watermark_rx) = watch::channel(0u64);
        let writer = RunWriter::start(
            log_dir.join(LOG_FILE_NAME),
            &settings.pipeline_config(),
            Arc::clone(&lifecycle),
            Some(watermark_tx),
        )?;
        let handle = RunHandle {
            producer: Arc::new(Mutex::new(writer.producer())),
            lifecycle,
        };

        let offline = transport.is_none();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let uploader = match transport {
            Some(transport) => Some(spawn_uploader(
                log_dir.clone(),
                transport,
                target.clone(),
                settings,
                shutdown_rx,
                watermark_rx,
            )?),
            None => {
                info!(
                    run_id = %target.run_id,
                    log_dir = %log_dir.display(),
                    "offline run; upload later with `runsync sync {}`",
                    log_dir.display()
                );
                None
            }
        };

        let info = RunInfo {
            target,
            log_dir,
            started_at_ms,
            offline,
            resumed,
        };
        info!(
            run_id = %info.target.run_id,
            log_dir = %info.log_dir.display(),
            resumed,
            offline,
            "run started"
        );

        Ok(Self {
            info,
            writer,
            handle,
            shutdown,
            uploader,
            #[cfg(unix)]
            ipc: None,
        })
    }

    #[must_use]
    pub const fn info(&self) -> &RunInfo {
        &self.info
    }

    /// A new producer for the calling thread.
    #[must_use]
    pub fn producer(&self) -> Producer {
        self.writer.producer()
    }

    #[must_use]
    pub fn producer_factory(&self) -> ProducerFactory {
        self.writer.factory()
    }

    #[must_use]
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.writer.stats()
    }

    /// Write and fsync everything enqueued so far.
    pub fn flush(&self) -> Result<u64> {
        Ok(self.writer.flush()?)
    }

    /// Accept records from other processes on a unix socket.
    #[cfg(unix)]
    pub fn serve_ipc(&mut self, socket_path: impl AsRef<Path>) -> Result<PathBuf> {
        if let Some(server) = &self.ipc {
            return Ok(server.path().to_path_buf());
        }
        let server = crate::ipc::IpcServer::bind(socket_path, self.writer.factory())?;
        let path = server.path().to_path_buf();
        self.ipc = Some(server);
        Ok(path)
    }

    /// Record the exit, drain the log and wait for the uploader.
    pub fn finish(self, exit_code: i32) -> Result<RunOutcome> {
        let Self {
            info,
            writer,
            handle,
            shutdown,
            uploader,
            #[cfg(unix)]
            ipc,
        } = self;

        #[cfg(unix)]
        if let Some(server) = ipc {
            let stats = server.shutdown();
            debug!(connections = stats.connections, records = stats.records, "ipc server stopped");
        }
        drop(handle);

        let written = writer.finish(exit_code);
        let _ = shutdown.send(true);
        let upload = match uploader {
            Some(thread) => Some(
                thread
                    .join()
                    .map_err(|_| Error::Runtime("uploader thread panicked".to_string()))??,
            ),
            None => None,
        };
        let pipeline = written?;

        let outcome = RunOutcome {
            target: info.target,
            log_dir: info.log_dir,
            exit_code,
            pipeline,
            upload,
        };
        if outcome.pipeline.dropped() > 0 {
            warn!(
                run_id = %outcome.target.run_id,
                dropped = outcome.pipeline.dropped(),
                "some records were dropped before reaching the log"
            );
        }
        if outcome.needs_sync() {
            warn!(
                run_id = %outcome.target.run_id,
                log_dir = %outcome.log_dir.display(),
                "run data is not fully uploaded; run `runsync sync {}`",
                outcome.log_dir.display()
            );
        }
        info!(run_id = %outcome.target.run_id, exit_code, clean = outcome.is_clean(), "run finished");
        Ok(outcome)
    }
}

fn spawn_uploader<T>(
    log_dir: PathBuf,
    transport: T,
    target: RunTarget,
    settings: &Settings,
    shutdown: watch::Receiver<bool>,
    watermark: watch::Receiver<u64>,
) -> Result<UploaderThread>
where
    T: Transport + Send + 'static,
{
    let config = settings.upload_config();
    let thread = std::thread::Builder::new()
        .name("runsync-uploader".to_string())
        .spawn(move || -> Result<UploadSummary> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let session = UploadSession::open(
                    &log_dir,
                    transport,
                    target,
                    config,
                    LIVE_UPLOADER,
                    DropPolicy::AdvancePastDropped,
                    None,
                )?;
                Ok(session.run(shutdown, watermark).await?)
            })
        })?;
    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ConsoleStream;
    use crate::transport::ScriptedTransport;
    use serde_json::json;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.upload.batch_window_ms = 10;
        settings.upload.poll_interval_ms = 5;
        settings
    }

    fn target() -> RunTarget {
        RunTarget::new("acme", "vision", "run-7")
    }

    #[test]
    fn target_key_joins_components() {
        assert_eq!(target().key(), "acme/vision/run-7");
        assert_eq!(target().to_string(), "acme/vision/run-7");
    }

    #[test]
    fn offline_run_writes_log_and_needs_sync() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::start_with_transport::<ScriptedTransport>(
            &settings(),
            dir.path(),
            target(),
            None,
        )
        .unwrap();
        assert!(ctx.info().offline);
        let mut producer = ctx.producer();
        producer
            .enqueue(Record::metric(Some(0), json!({"loss": 1.0})).unwrap())
            .unwrap();
        let outcome = ctx.finish(0).unwrap();
        assert!(outcome.upload.is_none());
        assert!(outcome.needs_sync());
        assert_eq!(outcome.pipeline.written, 2);
        assert!(dir.path().join(LOG_FILE_NAME).exists());

        let store = MetaStore::open(dir.path()).unwrap();
        let stored = store.run_info().unwrap().unwrap();
        assert_eq!(RunTarget::from(&stored), target());
    }

    #[test]
    fn live_run_uploads_everything() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = RunContext::start_with_transport(
            &settings(),
            dir.path(),
            target(),
            Some(Arc::clone(&transport)),
        )
        .unwrap();
        let mut producer = ctx.producer();
        for step in 0..5u64 {
            producer
                .enqueue(Record::metric(Some(step), json!({"loss": step})).unwrap())
                .unwrap();
        }
        producer
            .enqueue(Record::console(ConsoleStream::Stdout, "epoch done"))
            .unwrap();
        let outcome = ctx.finish(3).unwrap();

        let upload = outcome.upload.clone().unwrap();
        assert!(upload.complete);
        assert_eq!(upload.exit_code, Some(3));
        assert!(outcome.is_clean());
        assert_eq!(transport.lines_for("history.jsonl").len(), 5);
        assert_eq!(transport.lines_for("output.log").len(), 1);
        let last = transport.requests().pop().unwrap();
        assert_eq!(last.complete, Some(true));
        assert_eq!(last.exitcode, Some(3));
    }

    #[test]
    fn handle_drives_pause_and_preemption() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::start_with_transport::<ScriptedTransport>(
            &settings(),
            dir.path(),
            target(),
            None,
        )
        .unwrap();
        let handle = ctx.handle();
        assert_eq!(handle.pause().unwrap(), RunState::Paused);
        assert_eq!(handle.pause().unwrap(), RunState::Paused);
        assert_eq!(handle.resume().unwrap(), RunState::Running);
        assert_eq!(handle.mark_preempting().unwrap(), RunState::Preempting);
        assert_eq!(handle.mark_preempting().unwrap(), RunState::Preempting);

        let token = InterruptToken::new();
        assert_eq!(
            handle.wait_while_paused(&token, Duration::from_millis(10)),
            PauseWait::Running
        );

        let outcome = ctx.finish(0).unwrap();
        assert_eq!(handle.state(), RunState::Finished);
        assert_eq!(outcome.pipeline.lifecycle_noops, 2);
    }

    #[test]
    fn restarted_run_keeps_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunContext::start_with_transport::<ScriptedTransport>(
            &settings(),
            dir.path(),
            target(),
            None,
        )
        .unwrap();
        let started = first.info().started_at_ms;
        first.writer.shutdown().unwrap();

        let second = RunContext::start_with_transport::<ScriptedTransport>(
            &settings(),
            dir.path(),
            target(),
            None,
        )
        .unwrap();
        assert!(second.info().resumed);
        assert_eq!(second.info().started_at_ms, started);
        second.finish(0).unwrap();
    }
}
