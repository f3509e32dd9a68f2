//! Local queue capacity enforcement.
//!
//! The durable queue is bounded by a batch count and a byte budget. When an
//! outage outlasts the budget, batches are evicted in a fixed order:
//!
//! 1. Batches that have already failed at least one replay (`retry_count > 0`),
//!    oldest `LocalSnapshotId` first.
//! 2. Only then, never-attempted batches, oldest first.
//!
//! # Design Principles
//!
//! 1. **No silent deletions**: every eviction produces an [`EvictionEvent`],
//!    logged at warn level under the `hostwatch::data_loss` target.
//! 2. **Auditable**: events are appended to a JSONL log when an event
//!    directory is configured.
//! 3. **Predictable**: eviction order depends only on retry counts and
//!    snapshot order, never on wall-clock heuristics.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hw_common::{BatchId, LocalSnapshotId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Capacity bounds for the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolLimits {
    /// Maximum number of queued batches.
    pub max_batches: usize,

    /// Maximum total bytes of queued records.
    pub max_bytes: u64,
}

impl Default for SpoolLimits {
    fn default() -> Self {
        SpoolLimits {
            max_batches: 10_000,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Why a batch left the queue without reaching the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EvictionReason {
    /// Queue held more batches than allowed.
    CountLimitExceeded { max_batches: usize, queued: usize },

    /// Queue held more bytes than allowed.
    ByteLimitExceeded { max_bytes: u64, queued_bytes: u64 },

    /// Primary store kept rejecting the batch's content.
    RejectionCeiling { rejections: u32, ceiling: u32 },

    /// A newer batch was queued under the same `LocalSnapshotId`.
    DuplicateSnapshot { kept: BatchId },
}

impl EvictionReason {
    /// Short label for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            EvictionReason::CountLimitExceeded { .. } => "count_limit",
            EvictionReason::ByteLimitExceeded { .. } => "byte_limit",
            EvictionReason::RejectionCeiling { .. } => "rejection_ceiling",
            EvictionReason::DuplicateSnapshot { .. } => "duplicate_snapshot",
        }
    }
}

/// A data-loss event recording one evicted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionEvent {
    /// When the eviction occurred.
    pub timestamp: DateTime<Utc>,

    pub batch_id: BatchId,

    pub local_snapshot_id: LocalSnapshotId,

    /// Capture time of the evicted telemetry.
    pub captured_at: DateTime<Utc>,

    pub host_id: String,

    /// Failed replays at eviction time.
    pub retry_count: u32,

    /// Most recent failure recorded for the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// On-disk size of the evicted record.
    pub size_bytes: u64,

    pub reason: EvictionReason,
}

impl EvictionEvent {
    /// Emit the event on the data-loss log target.
    pub fn log(&self) {
        warn!(
            target: "hostwatch::data_loss",
            batch_id = %self.batch_id,
            local_snapshot_id = self.local_snapshot_id.0,
            captured_at = %self.captured_at.to_rfc3339(),
            retry_count = self.retry_count,
            last_error = ?self.last_error,
            size_bytes = self.size_bytes,
            reason = self.reason.label(),
            "telemetry batch evicted from local queue"
        );
    }
}

/// The queue's view of a batch when deciding evictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub batch_id: BatchId,
    pub local_snapshot_id: LocalSnapshotId,
    pub size_bytes: u64,
    pub retry_count: u32,
}

/// Decide which batches to evict so the queue fits within `limits`.
///
/// `entries` may be in any order. `protect` names a batch that must survive
/// (the one being enqueued). Returns victims in eviction order with the limit
/// that forced each eviction.
pub fn plan_evictions(
    entries: &[EvictionCandidate],
    limits: SpoolLimits,
    protect: Option<BatchId>,
) -> Vec<(BatchId, EvictionReason)> {
    let mut count = entries.len();
    let mut bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();

    if count <= limits.max_batches && bytes <= limits.max_bytes {
        return Vec::new();
    }

    let mut order: Vec<&EvictionCandidate> = entries
        .iter()
        .filter(|e| Some(e.batch_id) != protect)
        .collect();
    // Retried batches first, each group oldest snapshot first
    order.sort_by_key(|e| (e.retry_count == 0, e.local_snapshot_id));

    let mut victims = Vec::new();
    for candidate in order {
        let reason = if count > limits.max_batches {
            EvictionReason::CountLimitExceeded {
                max_batches: limits.max_batches,
                queued: count,
            }
        } else if bytes > limits.max_bytes {
            EvictionReason::ByteLimitExceeded {
                max_bytes: limits.max_bytes,
                queued_bytes: bytes,
            }
        } else {
            break;
        };

        victims.push((candidate.batch_id, reason));
        count -= 1;
        bytes = bytes.saturating_sub(candidate.size_bytes);
    }

    victims
}

/// Append-only JSONL sink for eviction events.
#[derive(Debug, Clone, Default)]
pub struct EvictionLog {
    dir: Option<PathBuf>,
}

impl EvictionLog {
    /// Log into `dir`, or only to tracing when `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        EvictionLog { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Log every event and persist them to the daily event file.
    pub fn record(&self, events: &[EvictionEvent]) -> std::io::Result<()> {
        for event in events {
            event.log();
        }

        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if events.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("evictions_{}.jsonl", Utc::now().format("%Y%m%d")));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        info!(
            "Wrote {} eviction events to {}",
            events.len(),
            path.display()
        );
        Ok(())
    }
}
