//! Resilient writer: the single persistence entry point for the sampler.
//!
//! [`ResilientWriter::write`] tries the primary store and falls back to the
//! durable local queue. [`ResilientWriter::replay_pending`] drains the queue
//! back into the primary store in `LocalSnapshotId` order.
//!
//! Neither call returns an error to its caller. Problems are reported through
//! [`WriteOutcome`], [`ReplayReport`], logs, and the [`HealthMonitor`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hw_common::{BatchId, LocalSnapshotId, TelemetryBatch};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::policy::{ReplayDecision, RetryPolicy};
use crate::retention::{EvictionEvent, EvictionReason};
use crate::spool::{lock, QueueStats, SharedSpool, SpoolError};
use crate::store::{FailureClass, PrimaryStore};

/// A batch that reached neither the primary store nor the local queue.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("batch {batch_id} (snapshot {local_snapshot_id}) lost: {reason}")]
pub struct PersistenceFailed {
    pub batch_id: BatchId,
    pub local_snapshot_id: LocalSnapshotId,
    pub reason: String,
}

/// Why a batch went to the local queue instead of the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum EnqueueReason {
    /// Older batches are still queued; writing this one first would reorder them.
    Backlog,
    /// The primary store write failed.
    PrimaryFailed(String),
    /// Shutdown was requested before the write was attempted.
    Cancelled,
}

/// Result of [`ResilientWriter::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Written to the primary store.
    Persisted,
    /// Durably queued for replay. `evicted` lists batches dropped to make room.
    Enqueued {
        reason: EnqueueReason,
        evicted: Vec<EvictionEvent>,
    },
    /// Lost for this cycle.
    Failed(PersistenceFailed),
}

impl WriteOutcome {
    /// Label for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            WriteOutcome::Persisted => "persisted",
            WriteOutcome::Enqueued { .. } => "enqueued",
            WriteOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, WriteOutcome::Persisted)
    }
}

/// Summary of one replay cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub started_at: Option<DateTime<Utc>>,

    /// Batches in the queue snapshot this cycle worked from.
    pub pending_at_start: usize,

    /// Batches written and removed, in the order they were written.
    pub replayed: Vec<BatchId>,

    /// Failed attempts that left the batch queued.
    pub retried: usize,

    /// Of those, attempts the store rejected on content.
    pub rejected: usize,

    /// Batches dropped after reaching the rejection ceiling.
    pub evicted: Vec<EvictionEvent>,

    /// Unreadable records moved aside.
    pub quarantined: usize,

    /// The cycle ended early because the store was unreachable.
    pub stopped_on_connectivity: bool,

    /// The cycle ended early because shutdown was requested.
    pub cancelled: bool,

    /// Local queue failure that ended the cycle.
    pub storage_fault: Option<String>,

    /// Queue depth after the cycle.
    pub remaining: usize,
}

impl ReplayReport {
    /// True when the queue was fully drained.
    pub fn is_clean(&self) -> bool {
        self.remaining == 0 && self.storage_fault.is_none()
    }
}

/// Overall durability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum HealthStatus {
    Healthy,
    /// Local storage has failed for this many consecutive cycles.
    Degraded { consecutive_faults: u32 },
}

/// Tracks consecutive cycles with a local storage fault.
///
/// A single fault costs one batch. A run of `escalation_cycles` faults means
/// durability is gone and is reported as [`HealthStatus::Degraded`].
#[derive(Debug)]
pub struct HealthMonitor {
    escalation_cycles: u32,
    consecutive_faults: AtomicU32,
}

impl HealthMonitor {
    pub fn new(escalation_cycles: u32) -> Self {
        HealthMonitor {
            escalation_cycles: escalation_cycles.max(1),
            consecutive_faults: AtomicU32::new(0),
        }
    }

    pub fn record_ok(&self) {
        let previous = self.consecutive_faults.swap(0, Ordering::AcqRel);
        if previous >= self.escalation_cycles {
            info!(previous_faults = previous, "local queue storage recovered");
        }
    }

    pub fn record_storage_fault(&self, detail: &str) -> HealthStatus {
        let faults = self.consecutive_faults.fetch_add(1, Ordering::AcqRel) + 1;
        if faults == self.escalation_cycles {
            error!(
                target: "hostwatch::storage_fault",
                consecutive_faults = faults,
                detail,
                "local queue storage failing repeatedly; telemetry durability is not guaranteed"
            );
        }
        self.status()
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults.load(Ordering::Acquire)
    }

    pub fn status(&self) -> HealthStatus {
        let faults = self.consecutive_faults();
        if faults >= self.escalation_cycles {
            HealthStatus::Degraded {
                consecutive_faults: faults,
            }
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Primary store decorated with a durable local queue.
pub struct ResilientWriter {
    store: Arc<dyn PrimaryStore>,
    spool: SharedSpool,
    policy: RetryPolicy,
    health: HealthMonitor,
}

impl ResilientWriter {
    pub fn new(store: Arc<dyn PrimaryStore>, spool: SharedSpool, policy: RetryPolicy) -> Self {
        ResilientWriter {
            store,
            spool,
            policy,
            health: HealthMonitor::new(3),
        }
    }

    pub fn with_health(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn spool(&self) -> &SharedSpool {
        &self.spool
    }

    /// Fast-path reachability check of the primary store, for status reporting.
    pub fn is_primary_reachable(&self) -> bool {
        self.store.is_reachable()
    }

    pub fn queue_stats(&self, now: DateTime<Utc>) -> QueueStats {
        lock(&self.spool).stats(now, &self.policy)
    }

    /// Persist one batch, never blocking on or failing because of the primary store.
    pub fn write(&self, batch: TelemetryBatch, cancel: &AtomicBool) -> WriteOutcome {
        if cancel.load(Ordering::Acquire) {
            return self.enqueue(batch, EnqueueReason::Cancelled);
        }

        let backlog = !lock(&self.spool).is_empty();
        if backlog {
            return self.enqueue(batch, EnqueueReason::Backlog);
        }

        match self.store.write_batch(&batch) {
            Ok(()) => {
                debug!(
                    batch_id = %batch.batch_id(),
                    local_snapshot_id = batch.local_snapshot_id().0,
                    "batch persisted to primary store"
                );
                WriteOutcome::Persisted
            }
            Err(e) => {
                match e.class() {
                    FailureClass::Transient => info!(
                        batch_id = %batch.batch_id(),
                        error = %e,
                        "primary store unavailable, queueing batch locally"
                    ),
                    FailureClass::Rejected => warn!(
                        batch_id = %batch.batch_id(),
                        local_snapshot_id = batch.local_snapshot_id().0,
                        host_id = batch.host_id(),
                        captured_at = %batch.timestamp().to_rfc3339(),
                        processes = batch.processes().len(),
                        error = %e,
                        "primary store rejected batch, queueing for replay"
                    ),
                }
                let mut batch = batch;
                let retry_count = batch.retry_count();
                batch.apply_retry_state(retry_count, Some(e.to_string()));
                self.enqueue(batch, EnqueueReason::PrimaryFailed(e.to_string()))
            }
        }
    }

    fn enqueue(&self, batch: TelemetryBatch, reason: EnqueueReason) -> WriteOutcome {
        let batch_id = batch.batch_id();
        let local_snapshot_id = batch.local_snapshot_id();

        let result = lock(&self.spool).enqueue(batch);
        match result {
            Ok(evicted) => {
                self.health.record_ok();
                WriteOutcome::Enqueued { reason, evicted }
            }
            Err(e) => {
                error!(
                    target: "hostwatch::storage_fault",
                    batch_id = %batch_id,
                    local_snapshot_id = local_snapshot_id.0,
                    error = %e,
                    "failed to queue batch locally; telemetry for this cycle is lost"
                );
                self.health.record_storage_fault(&e.to_string());
                WriteOutcome::Failed(PersistenceFailed {
                    batch_id,
                    local_snapshot_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Offer every queued batch to the primary store, oldest first.
    ///
    /// Works from a snapshot of the queue taken at the start of the cycle. The
    /// queue lock is released while the store is called, so the live write
    /// path is never blocked by a slow store.
    pub fn replay_pending(&self, cancel: &AtomicBool) -> ReplayReport {
        let mut report = ReplayReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let snapshot = lock(&self.spool).list_pending();
        report.pending_at_start = snapshot.len();
        // Only a completed write to the queue directory clears storage faults
        let mut local_writes = 0usize;

        for item in snapshot {
            if cancel.load(Ordering::Acquire) {
                report.cancelled = true;
                break;
            }

            let record = match item {
                Ok(record) => record,
                Err(SpoolError::Corrupt {
                    batch_id: Some(batch_id),
                    path,
                    reason,
                }) => {
                    warn!(batch_id = %batch_id, path = %path.display(), reason = %reason, "skipping unreadable queue record");
                    match lock(&self.spool).quarantine(batch_id) {
                        Ok(moved) => {
                            report.quarantined += 1;
                            local_writes += usize::from(moved);
                        }
                        Err(e) => {
                            report.storage_fault = Some(e.to_string());
                            break;
                        }
                    }
                    continue;
                }
                Err(e) => {
                    report.storage_fault = Some(e.to_string());
                    break;
                }
            };

            let batch_id = record.batch_id();
            match self.store.write_batch(&record.batch) {
                Ok(()) => {
                    match lock(&self.spool).remove(batch_id) {
                        Ok(removed) => local_writes += usize::from(removed),
                        Err(e) => {
                            // Already in the primary store; a later replay rewrites the same id
                            report.storage_fault = Some(e.to_string());
                            break;
                        }
                    }
                    debug!(
                        batch_id = %batch_id,
                        local_snapshot_id = record.batch.local_snapshot_id().0,
                        retry_count = record.batch.retry_count(),
                        "replayed batch"
                    );
                    report.replayed.push(batch_id);
                }
                Err(e) => {
                    let state = self.policy.record_failure(&record.retry_state(), &e);
                    let decision = self.policy.decide(&e, &state);
                    let rejections = state.rejection_count;

                    let mut spool = lock(&self.spool);
                    match spool.update_retry_state(batch_id, state) {
                        Ok(updated) => local_writes += usize::from(updated),
                        Err(err) => {
                            report.storage_fault = Some(err.to_string());
                            break;
                        }
                    }

                    match decision {
                        ReplayDecision::StopCycle => {
                            report.retried += 1;
                            report.stopped_on_connectivity = true;
                            info!(
                                target: "hostwatch::replay",
                                batch_id = %batch_id,
                                error = %e,
                                "primary store unreachable, ending replay cycle"
                            );
                            break;
                        }
                        ReplayDecision::SkipBatch => {
                            report.retried += 1;
                            report.rejected += 1;
                            warn!(
                                batch_id = %batch_id,
                                local_snapshot_id = record.batch.local_snapshot_id().0,
                                host_id = record.batch.host_id(),
                                captured_at = %record.batch.timestamp().to_rfc3339(),
                                rejections,
                                ceiling = self.policy.rejection_ceiling,
                                error = %e,
                                "primary store rejected queued batch"
                            );
                        }
                        ReplayDecision::Evict => {
                            let reason = EvictionReason::RejectionCeiling {
                                rejections,
                                ceiling: self.policy.rejection_ceiling,
                            };
                            match spool.evict(batch_id, reason) {
                                Ok(Some(event)) => {
                                    local_writes += 1;
                                    report.evicted.push(event);
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    report.storage_fault = Some(err.to_string());
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        report.remaining = lock(&self.spool).len();
        match &report.storage_fault {
            Some(fault) => {
                error!(target: "hostwatch::storage_fault", error = %fault, "replay cycle hit a local queue fault");
                self.health.record_storage_fault(fault);
            }
            None if local_writes > 0 => self.health.record_ok(),
            None => {}
        }

        info!(
            target: "hostwatch::replay",
            pending = report.pending_at_start,
            replayed = report.replayed.len(),
            retried = report.retried,
            rejected = report.rejected,
            evicted = report.evicted.len(),
            quarantined = report.quarantined,
            remaining = report.remaining,
            stopped_on_connectivity = report.stopped_on_connectivity,
            cancelled = report.cancelled,
            "replay cycle finished"
        );
        report
    }
}
