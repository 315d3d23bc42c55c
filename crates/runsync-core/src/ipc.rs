//! Multi-process record intake over a unix socket.
//!
//! Each client speaks newline-delimited JSON frames: one `hello` carrying its
//! pid, any number of `record` frames, then `bye`. Every connection gets its
//! own [`Producer`], so per-process ordering is kept while the single log
//! writer interleaves processes.

use crate::pipeline::{PipelineError, Producer, ProducerFactory};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Read timeout used to notice server shutdown.
const READ_POLL: Duration = Duration::from_millis(200);

/// Largest accepted frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Hello { pid: u32 },
    Record { record: Record },
    Bye,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IpcStats {
    /// Clients that said hello.
    pub connections: u64,
    pub records: u64,
    /// Records the pipeline refused; each one closes its connection.
    pub rejected: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    records: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IpcStats {
        IpcStats {
            connections: self.connections.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Listening side, owned by the run.
#[derive(Debug)]
pub struct IpcServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    accept: Option<JoinHandle<Vec<JoinHandle<()>>>>,
}

impl IpcServer {
    /// Bind `path`, replacing a stale socket file left by a crashed run.
    pub fn bind(path: impl AsRef<Path>, factory: ProducerFactory) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            match UnixStream::connect(&path) {
                Ok(_) => {
                    return Err(io::Error::new(
                        ErrorKind::AddrInUse,
                        format!("{} is served by another process", path.display()),
                    ));
                }
                Err(_) => std::fs::remove_file(&path)?,
            }
        }
        let listener = UnixListener::bind(&path)?;

        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let accept = {
            let stop = Arc::clone(&stop);
            let counters = Arc::clone(&counters);
            std::thread::Builder::new()
                .name("runsync-ipc-accept".to_string())
                .spawn(move || accept_loop(&listener, &factory, &stop, &counters))?
        };
        info!(socket = %path.display(), "ipc server listening");

        Ok(Self {
            path,
            stop,
            counters,
            accept: Some(accept),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn stats(&self) -> IpcStats {
        self.counters.snapshot()
    }

    /// Stop accepting, wait for open connections to go quiet, remove the
    /// socket file.
    pub fn shutdown(mut self) -> IpcStats {
        self.stop_inner();
        self.counters.snapshot()
    }

    fn stop_inner(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        match accept.join() {
            Ok(connections) => {
                for connection in connections {
                    let _ = connection.join();
                }
            }
            Err(_) => warn!(socket = %self.path.display(), "ipc accept thread panicked"),
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

fn accept_loop(
    listener: &UnixListener,
    factory: &ProducerFactory,
    stop: &Arc<AtomicBool>,
    counters: &Arc<Counters>,
) -> Vec<JoinHandle<()>> {
    let mut connections = Vec::new();
    let mut spawn = |stream: UnixStream| {
        let factory = factory.clone();
        let stop = Arc::clone(stop);
        let counters = Arc::clone(counters);
        match std::thread::Builder::new()
            .name("runsync-ipc-conn".to_string())
            .spawn(move || serve_connection(stream, &factory, &stop, &counters))
        {
            Ok(handle) => {
                connections.retain(|handle: &JoinHandle<()>| !handle.is_finished());
                connections.push(handle);
            }
            Err(e) => warn!(error = %e, "failed to spawn ipc connection thread"),
        }
    };

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => spawn(stream),
            Err(e) => warn!(error = %e, "ipc accept failed"),
        }
        if stop.load(Ordering::Acquire) {
            // Clients queued before the wake-up connect still get served.
            if listener.set_nonblocking(true).is_ok() {
                while let Ok((stream, _)) = listener.accept() {
                    spawn(stream);
                }
            }
            break;
        }
    }
    connections
}

fn serve_connection(
    stream: UnixStream,
    factory: &ProducerFactory,
    stop: &AtomicBool,
    counters: &Counters,
) {
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(READ_POLL)))
    {
        warn!(error = %e, "ipc socket setup failed");
        return;
    }
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut producer: Option<Producer> = None;

    loop {
        let budget = (MAX_FRAME_BYTES + 1).saturating_sub(line.len()) as u64;
        match (&mut reader).take(budget).read_until(b'\n', &mut line) {
            Ok(_) if line.len() > MAX_FRAME_BYTES => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(bytes = line.len(), "ipc frame too large; closing connection");
                break;
            }
            Ok(0) if line.is_empty() => break,
            Ok(_) if !line.ends_with(b"\n") => {
                // EOF in the middle of a frame.
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                break;
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if stop.load(Ordering::Acquire) && line.is_empty() {
                    break;
                }
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "ipc connection read failed");
                break;
            }
        }

        let frame = serde_json::from_slice::<Frame>(&line);
        line.clear();
        match frame {
            Ok(Frame::Hello { pid }) => {
                counters.connections.fetch_add(1, Ordering::Relaxed);
                let p = factory.producer_for_pid(pid);
                debug!(pid, producer_id = p.id(), "ipc client connected");
                producer = Some(p);
            }
            Ok(Frame::Record { record }) => {
                let Some(p) = producer.as_mut() else {
                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("ipc record before hello; closing connection");
                    break;
                };
                match enqueue_waiting(p, record, stop) {
                    Ok(()) => {
                        counters.records.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(pid = p.pid(), error = %e, "ipc record not accepted; closing connection");
                        break;
                    }
                }
            }
            Ok(Frame::Bye) => break,
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "malformed ipc frame");
            }
        }
    }
}

/// Enqueue `record`, waiting out a full queue until the server stops.
///
/// The client is held back by the socket buffer meanwhile. Once stopping,
/// one more attempt is made before giving up.
fn enqueue_waiting(
    producer: &mut Producer,
    record: Record,
    stop: &AtomicBool,
) -> Result<(), PipelineError> {
    let mut stalled = false;
    loop {
        let stopping = stop.load(Ordering::Acquire);
        match producer.enqueue(record.clone()) {
            Err(PipelineError::Backpressure { timeout_ms }) if !stopping => {
                if !stalled {
                    stalled = true;
                    debug!(pid = producer.pid(), timeout_ms, "log queue full; holding ipc client back");
                }
            }
            result => return result,
        }
    }
}

/// Sending side, used by child processes.
#[derive(Debug)]
pub struct IpcClient {
    writer: BufWriter<UnixStream>,
}

impl IpcClient {
    /// Connect and announce this process.
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::connect_as(path, std::process::id())
    }

    pub fn connect_as(path: impl AsRef<Path>, pid: u32) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        let mut client = Self {
            writer: BufWriter::new(stream),
        };
        client.write_frame(&Frame::Hello { pid })?;
        client.writer.flush()?;
        Ok(client)
    }

    pub fn send(&mut self, record: Record) -> io::Result<()> {
        self.write_frame(&Frame::Record { record })
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Say goodbye and flush; the server finishes this connection's records.
    pub fn close(mut self) -> io::Result<()> {
        self.write_frame(&Frame::Bye)?;
        self.writer.flush()
    }

    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, frame)?;
        self.writer.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{LogSink, PipelineConfig, RunWriter};
    use crate::record::{ConsoleStream, Envelope, epoch_ms_now};
    use crate::run_state::{RunLifecycle, SharedLifecycle};
    use crate::txlog::{TxLogError, TxLogReader};
    use serde_json::json;

    fn writer(dir: &Path) -> RunWriter {
        let lifecycle = Arc::new(SharedLifecycle::new(RunLifecycle::new(epoch_ms_now())));
        RunWriter::start(dir.join("run.rslog"), &PipelineConfig::default(), lifecycle, None)
            .unwrap()
    }

    fn records(dir: &Path) -> Vec<Envelope> {
        TxLogReader::open(dir.join("run.rslog"))
            .unwrap()
            .read_from(0)
            .unwrap()
            .map(|entry| entry.unwrap().decode().unwrap())
            .collect()
    }

    #[test]
    fn frames_use_tagged_json() {
        let frame = serde_json::to_value(Frame::Hello { pid: 42 }).unwrap();
        assert_eq!(frame, json!({"frame": "hello", "pid": 42}));
        let bye: Frame = serde_json::from_str(r#"{"frame":"bye"}"#).unwrap();
        assert_eq!(bye, Frame::Bye);
    }

    #[test]
    fn records_from_two_processes_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let socket = dir.path().join("runsync.sock");
        let server = IpcServer::bind(&socket, writer.factory()).unwrap();

        let mut a = IpcClient::connect_as(&socket, 1001).unwrap();
        let mut b = IpcClient::connect_as(&socket, 1002).unwrap();
        for step in 0..10u64 {
            a.send(Record::metric(Some(step), json!({"a": step})).unwrap())
                .unwrap();
            b.send(Record::console(ConsoleStream::Stdout, format!("b{step}")))
                .unwrap();
        }
        a.close().unwrap();
        b.close().unwrap();

        let stats = server.shutdown();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.records, 20);
        assert!(!socket.exists());
        writer.shutdown().unwrap();

        let envelopes = records(dir.path());
        assert_eq!(envelopes.len(), 20);
        for pid in [1001, 1002] {
            let seqs: Vec<u64> = envelopes
                .iter()
                .filter(|env| env.pid == pid)
                .map(|env| env.producer_seq)
                .collect();
            assert_eq!(seqs, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn malformed_frames_are_counted_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let socket = dir.path().join("runsync.sock");
        let server = IpcServer::bind(&socket, writer.factory()).unwrap();

        let mut client = IpcClient::connect_as(&socket, 7).unwrap();
        client.writer.write_all(b"{not json}\n").unwrap();
        client
            .send(Record::summary(json!({"acc": 1})).unwrap())
            .unwrap();
        client.close().unwrap();

        let stats = server.shutdown();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.records, 1);
        writer.shutdown().unwrap();
        assert_eq!(records(dir.path()).len(), 1);
    }

    /// Sink that blocks each append until released.
    struct GatedSink {
        gate: crossbeam::channel::Receiver<()>,
        appended: u64,
    }

    impl LogSink for GatedSink {
        fn append(&mut self, _payload: &[u8]) -> Result<u64, TxLogError> {
            let _ = self.gate.recv();
            self.appended += 1;
            Ok(self.appended)
        }

        fn sync(&mut self) -> Result<(), TxLogError> {
            Ok(())
        }

        fn next_offset(&self) -> u64 {
            self.appended
        }

        fn entry_count(&self) -> u64 {
            0
        }
    }

    #[test]
    fn full_queue_holds_client_back_instead_of_dropping() {
        let dir = tempfile::tempdir().unwrap();
        let (release, gate) = crossbeam::channel::unbounded();
        let config = PipelineConfig {
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        };
        let lifecycle = Arc::new(SharedLifecycle::new(RunLifecycle::new(epoch_ms_now())));
        let writer =
            RunWriter::start_with_sink(GatedSink { gate, appended: 0 }, &config, lifecycle, None)
                .unwrap();
        let socket = dir.path().join("runsync.sock");
        let server = IpcServer::bind(&socket, writer.factory()).unwrap();

        let mut client = IpcClient::connect_as(&socket, 55).unwrap();
        for step in 0..5u64 {
            client
                .send(Record::metric(Some(step), json!({"loss": step})).unwrap())
                .unwrap();
        }
        client.close().unwrap();

        // Several enqueue timeouts pass while the sink is stalled.
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(server.stats().rejected, 0);
        for _ in 0..5 {
            release.send(()).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while server.stats().records < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = server.shutdown();
        assert_eq!(stats.records, 5);
        assert_eq!(stats.rejected, 0);
        let written = writer.shutdown().unwrap().written;
        assert_eq!(written, 5);
    }

    #[test]
    fn oversized_frame_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let socket = dir.path().join("runsync.sock");
        let server = IpcServer::bind(&socket, writer.factory()).unwrap();

        let mut client = IpcClient::connect_as(&socket, 9).unwrap();
        client.flush().unwrap();
        let blob = vec![b'x'; MAX_FRAME_BYTES + 16];
        // The server stops reading mid-frame, so the write may fail.
        let _ = client
            .writer
            .write_all(&blob)
            .and_then(|()| client.writer.flush());
        drop(client);

        let stats = server.shutdown();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.records, 0);
        writer.shutdown().unwrap();
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let socket = dir.path().join("runsync.sock");
        std::fs::write(&socket, b"").unwrap();
        let server = IpcServer::bind(&socket, writer.factory()).unwrap();
        assert!(socket.exists());

        let err = IpcServer::bind(&socket, writer.factory()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
        server.shutdown();
    }
}
