//! Property-based tests for delivery order and exactly-once storage.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hw_common::{LocalSnapshotId, SampleCycle, TelemetryBatch};
use hw_telemetry::spool::lock;
use hw_telemetry::{DurableQueue, MemoryStore, ResilientWriter, RetryPolicy, SpoolSettings};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Step {
    Write { store_up: bool, lose_ack: bool },
    Replay { store_up: bool },
    Restart,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (any::<bool>(), prop::bool::weighted(0.1))
            .prop_map(|(store_up, lose_ack)| Step::Write { store_up, lose_ack }),
        2 => any::<bool>().prop_map(|store_up| Step::Replay { store_up }),
        1 => Just(Step::Restart),
    ]
}

fn open_writer(dir: &TempDir, store: &Arc<MemoryStore>) -> ResilientWriter {
    let spool = DurableQueue::open(SpoolSettings::new(dir.path().join("spool")))
        .unwrap()
        .into_shared();
    ResilientWriter::new(store.clone(), spool, RetryPolicy::default())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn batches_reach_primary_once_in_snapshot_order(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cancel = AtomicBool::new(false);
        let mut writer = open_writer(&dir, &store);
        let mut next_id = 1u64;

        for step in &steps {
            match step {
                Step::Write { store_up, lose_ack } => {
                    store.set_down(!store_up);
                    let batch = TelemetryBatch::new(
                        LocalSnapshotId(next_id),
                        "prop-host",
                        SampleCycle::default(),
                    );
                    if *lose_ack {
                        store.lose_ack_once(batch.batch_id());
                    }
                    next_id += 1;
                    writer.write(batch, &cancel);
                }
                Step::Replay { store_up } => {
                    store.set_down(!store_up);
                    writer.replay_pending(&cancel);
                }
                Step::Restart => {
                    drop(writer);
                    writer = open_writer(&dir, &store);
                }
            }
        }

        // Each pending lost acknowledgement can end one more cycle early
        store.set_down(false);
        let mut report = writer.replay_pending(&cancel);
        for _ in 0..steps.len() {
            if report.is_clean() {
                break;
            }
            report = writer.replay_pending(&cancel);
        }
        prop_assert!(report.is_clean(), "queue not drained: {:?}", report);
        prop_assert!(lock(writer.spool()).is_empty());

        let written = next_id - 1;
        prop_assert_eq!(store.len() as u64, written);

        // Duplicates are allowed after a lost acknowledgement, but first
        // deliveries must arrive in snapshot order
        let mut seen = HashSet::new();
        let first_deliveries: Vec<u64> = store
            .write_log()
            .iter()
            .filter(|w| seen.insert(w.batch_id))
            .map(|w| w.local_snapshot_id.0)
            .collect();
        prop_assert_eq!(first_deliveries, (1..=written).collect::<Vec<_>>());
    }
}
