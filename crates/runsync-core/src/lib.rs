//! runsync-core: durable local run logging and file-stream upload
//!
//! An instrumented process records metrics, config, summaries, console output
//! and artifact references into a local write-ahead log; an uploader drains the
//! log to a collector over HTTP, and the same log can be synced again later.
//!
//! # Architecture
//!
//! ```text
//! Producers (threads, IPC) → RunWriter → run.rslog (WAL)
//!                                           ↓
//!                         UploadSession → StreamBatcher → Transport → backend
//!                                           ↑
//!                         replay::sync (offline logs, marker in meta.db)
//! ```
//!
//! # Modules
//!
//! - `record`: record and envelope types
//! - `txlog`: framed, checksummed transaction log
//! - `meta_store`: SQLite metadata (run info, upload checkpoints)
//! - `run_state`: pause/resume/preempt/finish state machine
//! - `pipeline`: producers and the single log writer
//! - `ipc`: unix-socket intake for other processes
//! - `file_stream`: record → stream line mapping and batching
//! - `transport`: HTTP file-stream client and a scripted test double
//! - `retry`: backoff policy and async retry driver
//! - `uploader`: tails the log and posts batches with checkpoints
//! - `replay`: offline sync and log inspection
//! - `artifact_cache`: content-addressed artifact store
//! - `run`: run context tying the pieces together
//! - `config`, `logging`, `error`, `interrupt`: ambient support
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod artifact_cache;
pub mod config;
pub mod error;
pub mod file_stream;
pub mod interrupt;
#[cfg(unix)]
pub mod ipc;
pub mod logging;
pub mod meta_store;
pub mod pipeline;
pub mod record;
pub mod replay;
pub mod retry;
pub mod run;
pub mod run_state;
pub mod transport;
pub mod txlog;
pub mod uploader;

pub use error::{Error, ErrorClass, Result};
pub use record::{Envelope, Record};
pub use run::{RunContext, RunHandle, RunOutcome, RunTarget};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
