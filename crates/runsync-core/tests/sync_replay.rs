//! End-to-end offline flow: record a run with no backend, then sync it.

use serde_json::json;
use std::sync::Arc;

use runsync_core::config::Settings;
use runsync_core::record::{ConsoleStream, Record};
use runsync_core::replay::{SyncMode, SyncOptions, inspect, sync};
use runsync_core::run::{RunContext, RunTarget};
use runsync_core::transport::{FileStreamResponse, ResumeState, ScriptedReply, ScriptedTransport};
use runsync_core::uploader::UploadConfig;

fn offline_run(dir: &std::path::Path, steps: u64) {
    let ctx = RunContext::start_with_transport::<ScriptedTransport>(
        &Settings::default(),
        dir,
        RunTarget::new("acme", "vision", "offline-run"),
        None,
    )
    .unwrap();
    let mut producer = ctx.producer();
    producer
        .enqueue(Record::config(json!({"lr": 0.001, "batch": 32})).unwrap())
        .unwrap();
    for step in 0..steps {
        producer
            .enqueue(Record::metric(Some(step), json!({"loss": 1.0 / (step + 1) as f64})).unwrap())
            .unwrap();
    }
    producer
        .enqueue(Record::console(ConsoleStream::Stdout, "training done"))
        .unwrap();
    producer
        .enqueue(Record::summary(json!({"best_loss": 0.1})).unwrap())
        .unwrap();
    let outcome = ctx.finish(0).unwrap();
    assert!(outcome.needs_sync());
}

fn options(mode: SyncMode) -> SyncOptions {
    SyncOptions {
        mode,
        target: None,
        upload: UploadConfig {
            dynamic_limits: false,
            ..UploadConfig::default()
        },
    }
}

#[tokio::test]
async fn offline_run_syncs_once() {
    let dir = tempfile::tempdir().unwrap();
    offline_run(dir.path(), 10);

    let transport = Arc::new(ScriptedTransport::new());
    let first = sync(dir.path(), Arc::clone(&transport), options(SyncMode::Overwrite))
        .await
        .unwrap();
    assert!(first.log_complete);
    assert!(first.is_clean());
    assert_eq!(first.target.run_id, "offline-run");
    assert_eq!(first.entries_replayed, 14);

    assert_eq!(transport.lines_for("history.jsonl").len(), 10);
    assert_eq!(transport.lines_for("output.log").len(), 1);
    let config = transport.lines_for("config.json");
    assert!(config[&0].contains("\"lr\""));
    let summary = transport.lines_for("summary.json");
    assert!(summary[&0].contains("best_loss"));
    let last = transport.requests().pop().unwrap();
    assert_eq!(last.complete, Some(true));
    assert_eq!(last.exitcode, Some(0));

    let sent = transport.request_count();
    let second = sync(dir.path(), Arc::clone(&transport), options(SyncMode::Overwrite))
        .await
        .unwrap();
    assert_eq!(second.new_bytes, 0);
    assert_eq!(transport.request_count(), sent);

    let report = inspect(dir.path()).unwrap();
    assert!(report.complete);
    assert_eq!(report.entries, 14);
    assert!(report.checkpoints.contains_key("sync:acme/vision/offline-run"));
    assert!(!report.checkpoints.contains_key("uploader"));
}

#[tokio::test]
async fn same_log_can_sync_to_a_second_target() {
    let dir = tempfile::tempdir().unwrap();
    offline_run(dir.path(), 3);

    let transport = Arc::new(ScriptedTransport::new());
    sync(dir.path(), Arc::clone(&transport), options(SyncMode::Overwrite))
        .await
        .unwrap();
    let first_requests = transport.request_count();

    let other = Arc::new(ScriptedTransport::new());
    other.set_resume_state(ResumeState {
        history_line_count: 100,
        events_line_count: 0,
        output_line_count: 7,
    });
    let mut opts = options(SyncMode::Append);
    opts.target = Some(RunTarget::new("acme", "vision", "merged"));
    let summary = sync(dir.path(), Arc::clone(&other), opts).await.unwrap();

    assert!(summary.new_bytes > 0);
    assert_eq!(transport.request_count(), first_requests);
    let history = other.lines_for("history.jsonl");
    assert_eq!(history.keys().copied().collect::<Vec<_>>(), vec![100, 101, 102]);
    let output = other.lines_for("output.log");
    assert_eq!(output.keys().copied().collect::<Vec<_>>(), vec![7]);
}

#[tokio::test]
async fn failed_append_sync_keeps_backend_numbering() {
    let dir = tempfile::tempdir().unwrap();
    offline_run(dir.path(), 10);

    let transport = Arc::new(ScriptedTransport::new());
    transport.set_resume_state(ResumeState {
        history_line_count: 100,
        events_line_count: 0,
        output_line_count: 0,
    });
    transport.push(ScriptedReply::Ok(FileStreamResponse::default()));
    transport.push(ScriptedReply::Ok(FileStreamResponse::default()));
    transport.fail_with_status(403, 1);

    let mut opts = options(SyncMode::Append);
    opts.upload.max_request_bytes = 300;
    let err = sync(dir.path(), Arc::clone(&transport), opts.clone()).await;
    assert!(err.is_err());
    assert!(transport.request_count() >= 3);

    // The backend now also counts the lines it accepted before the failure.
    transport.set_resume_state(ResumeState {
        history_line_count: 106,
        events_line_count: 0,
        output_line_count: 1,
    });
    let summary = sync(dir.path(), Arc::clone(&transport), opts).await.unwrap();
    assert!(summary.is_clean());
    assert!(summary.log_complete);

    assert_eq!(transport.resume_queries(), 1);
    let history = transport.lines_for("history.jsonl");
    assert_eq!(
        history.keys().copied().collect::<Vec<_>>(),
        (100..110).collect::<Vec<_>>()
    );
    let output = transport.lines_for("output.log");
    assert_eq!(output.keys().copied().collect::<Vec<_>>(), vec![0]);
}
