//! Integration tests for the record pipeline: ordering across threads and
//! read-back through the transaction log.

use proptest::prelude::*;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use runsync_core::pipeline::{PipelineConfig, RunWriter};
use runsync_core::record::{Envelope, Record, epoch_ms_now};
use runsync_core::run_state::{RunLifecycle, RunState, SharedLifecycle};
use runsync_core::txlog::{LOG_FILE_NAME, TxLogReader};

fn start(dir: &Path) -> (RunWriter, Arc<SharedLifecycle>) {
    let lifecycle = Arc::new(SharedLifecycle::new(RunLifecycle::new(epoch_ms_now())));
    let writer = RunWriter::start(
        dir.join(LOG_FILE_NAME),
        &PipelineConfig::default(),
        Arc::clone(&lifecycle),
        None,
    )
    .unwrap();
    (writer, lifecycle)
}

fn read_back(dir: &Path) -> Vec<(u64, Envelope)> {
    TxLogReader::open(dir.join(LOG_FILE_NAME))
        .unwrap()
        .read_from(0)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let envelope = entry.decode().unwrap();
            (entry.offset, envelope)
        })
        .collect()
}

// ── Scenario ──

#[test]
fn two_metrics_read_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (writer, lifecycle) = start(dir.path());
    let mut producer = writer.producer();
    producer
        .enqueue(Record::metric(Some(0), json!({"loss": 1.0})).unwrap())
        .unwrap();
    producer
        .enqueue(Record::metric(Some(1), json!({"loss": 0.5})).unwrap())
        .unwrap();
    writer.finish(0).unwrap();
    assert_eq!(lifecycle.state(), RunState::Finished);

    let entries = read_back(dir.path());
    assert_eq!(entries.len(), 3);
    assert!(entries[0].0 < entries[1].0);
    assert_eq!(
        entries[0].1.record,
        Record::metric(Some(0), json!({"loss": 1.0})).unwrap()
    );
    assert_eq!(
        entries[1].1.record,
        Record::metric(Some(1), json!({"loss": 0.5})).unwrap()
    );
    assert_eq!(entries[2].1.record.exit_code(), Some(0));
}

// ── Concurrency ──

#[test]
fn producers_on_many_threads_keep_their_own_order() {
    let dir = tempfile::tempdir().unwrap();
    let (writer, _lifecycle) = start(dir.path());
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let mut producer = writer.producer();
            std::thread::spawn(move || {
                for i in 0..250u64 {
                    producer
                        .enqueue(Record::metric(Some(i), json!({"thread": t, "i": i})).unwrap())
                        .unwrap();
                }
                producer.id()
            })
        })
        .collect();
    let ids: Vec<u32> = threads.into_iter().map(|h| h.join().unwrap()).collect();
    let stats = writer.finish(0).unwrap();
    assert_eq!(stats.written, 1001);
    assert_eq!(stats.dropped(), 0);

    let entries = read_back(dir.path());
    let global: Vec<u64> = entries.iter().map(|(_, env)| env.seq).collect();
    assert_eq!(global, (0..1001).collect::<Vec<_>>());
    for id in ids {
        let seqs: Vec<u64> = entries
            .iter()
            .filter(|(_, env)| env.producer_id == id)
            .map(|(_, env)| env.producer_seq)
            .collect();
        assert_eq!(seqs, (0..250).collect::<Vec<_>>());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// N records from one producer come back in enqueue order from offset 0.
    #[test]
    fn prop_single_producer_order(losses in prop::collection::vec(-1_000_000i64..1_000_000, 1..120)) {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _lifecycle) = start(dir.path());
        let mut producer = writer.producer();
        for (step, loss) in losses.iter().enumerate() {
            producer
                .enqueue(Record::metric(Some(step as u64), json!({"loss": loss})).unwrap())
                .unwrap();
        }
        writer.shutdown().unwrap();

        let entries = read_back(dir.path());
        prop_assert_eq!(entries.len(), losses.len());
        let mut last_offset = 0;
        for (i, (offset, env)) in entries.iter().enumerate() {
            prop_assert!(*offset > last_offset);
            last_offset = *offset;
            prop_assert_eq!(env.producer_seq, i as u64);
            match &env.record {
                Record::Metric { step, values } => {
                    prop_assert_eq!(*step, Some(i as u64));
                    prop_assert_eq!(values["loss"].as_i64(), Some(losses[i]));
                }
                other => prop_assert!(false, "unexpected record {other:?}"),
            }
        }
    }
}
