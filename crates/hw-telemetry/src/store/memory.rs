//! In-memory primary store with failure injection.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use hw_common::{BatchId, LocalSnapshotId, TelemetryBatch};

use super::{PrimaryStore, StoreError};

/// One accepted write, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedWrite {
    pub batch_id: BatchId,
    pub local_snapshot_id: LocalSnapshotId,
    /// Retry count carried by the batch when it was accepted.
    pub retry_count: u32,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<BatchId, TelemetryBatch>,
    log: Vec<AcceptedWrite>,
    down: bool,
    rejected: HashSet<BatchId>,
    lose_ack: HashSet<BatchId>,
    stall: Option<Duration>,
    calls: usize,
}

/// Primary store kept in memory, upserting on `BatchId`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate an outage: every write fails with `Unavailable`.
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    /// Permanently reject one batch's content.
    pub fn reject(&self, batch_id: BatchId) {
        self.state().rejected.insert(batch_id);
    }

    pub fn accept(&self, batch_id: BatchId) {
        self.state().rejected.remove(&batch_id);
    }

    /// Store the batch on its next write but report failure, as if the
    /// confirmation was lost in transit.
    pub fn lose_ack_once(&self, batch_id: BatchId) {
        self.state().lose_ack.insert(batch_id);
    }

    /// Delay every write by `stall` before answering.
    pub fn set_stall(&self, stall: Option<Duration>) {
        self.state().stall = stall;
    }

    /// Distinct batches stored.
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, batch_id: BatchId) -> bool {
        self.state().records.contains_key(&batch_id)
    }

    pub fn get(&self, batch_id: BatchId) -> Option<TelemetryBatch> {
        self.state().records.get(&batch_id).cloned()
    }

    /// Every accepted write in order, duplicates included.
    pub fn write_log(&self) -> Vec<AcceptedWrite> {
        self.state().log.clone()
    }

    /// Snapshot ids of accepted writes in order.
    pub fn written_snapshot_ids(&self) -> Vec<u64> {
        self.state()
            .log
            .iter()
            .map(|w| w.local_snapshot_id.0)
            .collect()
    }

    /// Number of `write_batch` calls, failed ones included.
    pub fn calls(&self) -> usize {
        self.state().calls
    }
}

impl PrimaryStore for MemoryStore {
    fn write_batch(&self, batch: &TelemetryBatch) -> Result<(), StoreError> {
        let stall = {
            let mut state = self.state();
            state.calls += 1;
            state.stall
        };
        if let Some(stall) = stall {
            thread::sleep(stall);
        }

        let mut state = self.state();
        if state.down {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let batch_id = batch.batch_id();
        if state.rejected.contains(&batch_id) {
            return Err(StoreError::Rejected(format!(
                "constraint violation for batch {}",
                batch_id
            )));
        }

        state.records.insert(batch_id, batch.clone());
        state.log.push(AcceptedWrite {
            batch_id,
            local_snapshot_id: batch.local_snapshot_id(),
            retry_count: batch.retry_count(),
        });

        if state.lose_ack.remove(&batch_id) {
            return Err(StoreError::Unavailable(
                "connection reset before acknowledgement".to_string(),
            ));
        }
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        !self.state().down
    }
}
