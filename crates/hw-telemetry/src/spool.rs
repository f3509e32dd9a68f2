//! Durable local queue for telemetry batches that could not reach the primary store.
//!
//! Each queued batch is a self-contained record file named after its
//! [`BatchId`]:
//!
//! ```text
//! <spool_dir>/<batch_id>.batch
//!
//! HWQ1 <payload_len> <sha256_hex>\n
//! <payload: JSON QueuedRecord>
//! ```
//!
//! Records are written to `<batch_id>.batch.tmp`, fsynced, then renamed into
//! place, so a reader sees either the previous or the new version of a record.
//! On open, any record whose header, length, or checksum does not match is a
//! torn or damaged write: it is renamed to `.corrupt` and skipped, and the rest
//! of the queue loads normally.
//!
//! The queue keeps only an index in memory. [`DurableQueue::list_pending`]
//! snapshots the index and reads records lazily, so iterating never holds the
//! queue lock.
//!
//! One process owns a spool directory at a time: [`DurableQueue::open`] takes
//! an exclusive [`SpoolLock`]. [`DurableQueue::open_read_only`] builds an index
//! for inspection without the lock and refuses every mutation.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use hw_common::{BatchId, LocalSnapshotId, TelemetryBatch};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lockfile::{LockError, SpoolLock};
use crate::policy::RetryPolicy;
use crate::retention::{
    plan_evictions, EvictionCandidate, EvictionEvent, EvictionLog, EvictionReason, SpoolLimits,
};

/// Record file extension.
pub const RECORD_EXTENSION: &str = "batch";

const RECORD_MAGIC: &str = "HWQ1";
const TEMP_SUFFIX: &str = "batch.tmp";
const CORRUPT_SUFFIX: &str = "corrupt";

/// Errors from durable queue operations.
#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt queue record {}: {reason}", path.display())]
    Corrupt {
        batch_id: Option<BatchId>,
        path: PathBuf,
        reason: String,
    },

    #[error("record for batch {batch_id} is {size} bytes, larger than the queue budget of {limit} bytes")]
    RecordTooLarge {
        batch_id: BatchId,
        size: u64,
        limit: u64,
    },

    #[error("local queue {} is locked by another process", dir.display())]
    InUse { dir: PathBuf, pid: Option<u32> },

    #[error("local queue {} is open read-only", dir.display())]
    ReadOnly { dir: PathBuf },
}

impl From<SpoolError> for hw_common::Error {
    fn from(err: SpoolError) -> Self {
        match err {
            SpoolError::Corrupt { path, reason, .. } => hw_common::Error::CorruptRecord {
                path: path.display().to_string(),
                reason,
            },
            SpoolError::InUse { dir, pid } => hw_common::Error::SpoolInUse {
                dir: dir.display().to_string(),
                pid,
            },
            other => hw_common::Error::StorageFault(other.to_string()),
        }
    }
}

/// Retry bookkeeping persisted alongside a queued batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed replay attempts, of any kind.
    pub retry_count: u32,

    /// Description of the most recent failure.
    pub last_error: Option<String>,

    /// Failed replay attempts where the primary store rejected the content.
    pub rejection_count: u32,
}

/// A batch as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord {
    pub batch: TelemetryBatch,

    #[serde(default)]
    pub rejection_count: u32,

    /// When the batch entered the local queue.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedRecord {
    pub fn batch_id(&self) -> BatchId {
        self.batch.batch_id()
    }

    pub fn retry_state(&self) -> RetryState {
        RetryState {
            retry_count: self.batch.retry_count(),
            last_error: self.batch.last_error().map(str::to_string),
            rejection_count: self.rejection_count,
        }
    }
}

/// Settings for opening a queue.
#[derive(Debug, Clone)]
pub struct SpoolSettings {
    /// Directory holding the record files.
    pub dir: PathBuf,

    pub limits: SpoolLimits,

    /// Where eviction events are appended as JSON lines.
    pub event_log_dir: Option<PathBuf>,
}

impl SpoolSettings {
    /// Settings with default limits and no event log.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SpoolSettings {
            dir: dir.into(),
            limits: SpoolLimits::default(),
            event_log_dir: None,
        }
    }

    pub fn with_limits(mut self, limits: SpoolLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_event_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_log_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &hw_common::config::SpoolConfig) -> Self {
        SpoolSettings {
            dir: config.dir.clone(),
            limits: SpoolLimits {
                max_batches: config.max_batches,
                max_bytes: config.max_bytes,
            },
            event_log_dir: config.event_log_dir.clone(),
        }
    }
}

/// What was found on disk when the queue was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Records loaded into the queue.
    pub loaded: usize,

    /// Damaged records renamed to `.corrupt`.
    pub quarantined: usize,

    /// Leftover temp files from interrupted writes.
    pub temp_files_removed: usize,

    /// Older records evicted because a newer one claimed the same snapshot id.
    pub duplicates_evicted: usize,

    /// Damaged records seen by a read-only open and left in place.
    pub unreadable: usize,
}

/// Observability snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of queued batches.
    pub depth: usize,

    /// Total bytes of queued records.
    pub total_bytes: u64,

    /// Capture time of the oldest queued batch.
    pub oldest_captured_at: Option<DateTime<Utc>>,

    /// Age of the oldest queued batch, in seconds.
    pub oldest_age_secs: Option<u64>,

    pub oldest_local_snapshot_id: Option<LocalSnapshotId>,

    pub newest_local_snapshot_id: Option<LocalSnapshotId>,

    /// Batches whose retry count exceeds `stuck_threshold`.
    pub stuck_batches: usize,

    pub stuck_threshold: u32,

    pub limits: SpoolLimits,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    batch_id: BatchId,
    captured_at: DateTime<Utc>,
    host_id: String,
    size_bytes: u64,
    retry_count: u32,
}

/// Durable, bounded, ordered queue of telemetry batches.
pub struct DurableQueue {
    dir: PathBuf,
    /// `None` for a read-only view.
    lock: Option<SpoolLock>,
    limits: SpoolLimits,
    eviction_log: EvictionLog,
    by_snapshot: BTreeMap<LocalSnapshotId, IndexEntry>,
    by_batch: HashMap<BatchId, LocalSnapshotId>,
    total_bytes: u64,
    recovery: RecoveryReport,
}

/// Queue handle shared by the live write path and the replay path.
pub type SharedSpool = Arc<Mutex<DurableQueue>>;

/// Lock a shared queue.
///
/// A panic while holding the lock cannot leave a half-written record on disk
/// (writes go through rename), so a poisoned lock is recovered.
pub fn lock(spool: &SharedSpool) -> MutexGuard<'_, DurableQueue> {
    spool.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DurableQueue {
    /// Open (or create) a queue, take ownership of its directory, and load
    /// every intact record.
    ///
    /// Fails with [`SpoolError::InUse`] while another handle owns the directory.
    pub fn open(settings: SpoolSettings) -> Result<Self, SpoolError> {
        fs::create_dir_all(&settings.dir)?;
        let lock = SpoolLock::acquire(&settings.dir).map_err(|e| match e {
            LockError::Held { pid } => SpoolError::InUse {
                dir: settings.dir.clone(),
                pid,
            },
            LockError::Io(e) => SpoolError::Io(e),
        })?;

        let mut queue = Self::unloaded(settings, Some(lock));
        queue.load()?;

        info!(
            dir = %queue.dir.display(),
            loaded = queue.recovery.loaded,
            quarantined = queue.recovery.quarantined,
            temp_files_removed = queue.recovery.temp_files_removed,
            duplicates_evicted = queue.recovery.duplicates_evicted,
            "local queue opened"
        );
        Ok(queue)
    }

    /// Index a queue for inspection without taking ownership.
    ///
    /// Nothing on disk is changed: temp files and damaged records are left for
    /// the owner. A missing directory is an empty queue.
    pub fn open_read_only(settings: SpoolSettings) -> Result<Self, SpoolError> {
        let exists = settings.dir.is_dir();
        let mut queue = Self::unloaded(settings, None);
        if exists {
            queue.load()?;
        }
        Ok(queue)
    }

    fn unloaded(settings: SpoolSettings, lock: Option<SpoolLock>) -> Self {
        DurableQueue {
            dir: settings.dir,
            lock,
            limits: settings.limits,
            eviction_log: EvictionLog::new(settings.event_log_dir),
            by_snapshot: BTreeMap::new(),
            by_batch: HashMap::new(),
            total_bytes: 0,
            recovery: RecoveryReport::default(),
        }
    }

    /// Wrap into a [`SharedSpool`].
    pub fn into_shared(self) -> SharedSpool {
        Arc::new(Mutex::new(self))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    fn ensure_writable(&self) -> Result<(), SpoolError> {
        match self.lock {
            Some(_) => Ok(()),
            None => Err(SpoolError::ReadOnly {
                dir: self.dir.clone(),
            }),
        }
    }

    pub fn limits(&self) -> SpoolLimits {
        self.limits
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn len(&self) -> usize {
        self.by_snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_snapshot.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn contains(&self, batch_id: BatchId) -> bool {
        self.by_batch.contains_key(&batch_id)
    }

    /// Highest snapshot id currently queued.
    pub fn max_local_snapshot_id(&self) -> Option<LocalSnapshotId> {
        self.by_snapshot.keys().next_back().copied()
    }

    /// Durably persist a batch, evicting older batches if the queue is over budget.
    ///
    /// Returns the evictions this enqueue caused. Re-enqueueing a batch that is
    /// already queued replaces its record. An older batch queued under the same
    /// `LocalSnapshotId` is evicted.
    pub fn enqueue(&mut self, batch: TelemetryBatch) -> Result<Vec<EvictionEvent>, SpoolError> {
        self.ensure_writable()?;
        let batch_id = batch.batch_id();
        let rejection_count = match self.by_batch.get(&batch_id) {
            Some(_) => self
                .read_existing(batch_id)?
                .map_or(0, |record| record.rejection_count),
            None => 0,
        };
        let record = QueuedRecord {
            batch,
            rejection_count,
            enqueued_at: Utc::now(),
        };

        let bytes = encode_record(&record)?;
        let size = bytes.len() as u64;
        if size > self.limits.max_bytes {
            return Err(SpoolError::RecordTooLarge {
                batch_id,
                size,
                limit: self.limits.max_bytes,
            });
        }

        write_atomic(&self.record_path(batch_id), &bytes)?;
        let mut events: Vec<EvictionEvent> = self
            .displace_duplicate(record.batch.local_snapshot_id(), batch_id)?
            .into_iter()
            .collect();
        self.index_insert(&record, size);
        debug!(
            batch_id = %batch_id,
            local_snapshot_id = record.batch.local_snapshot_id().0,
            size_bytes = size,
            depth = self.len(),
            "batch enqueued"
        );

        events.extend(self.enforce_limits(Some(batch_id))?);
        Ok(events)
    }

    /// Snapshot the queue in ascending `LocalSnapshotId` order.
    ///
    /// The snapshot reads records lazily and does not borrow the queue.
    /// Batches enqueued after the call are not included; batches removed
    /// after the call are skipped.
    pub fn list_pending(&self) -> PendingSnapshot {
        let entries = self
            .by_snapshot
            .iter()
            .map(|(snapshot_id, entry)| {
                (*snapshot_id, entry.batch_id, self.record_path(entry.batch_id))
            })
            .collect();
        PendingSnapshot::new(entries)
    }

    /// Read one queued record.
    pub fn get(&self, batch_id: BatchId) -> Result<Option<QueuedRecord>, SpoolError> {
        if !self.by_batch.contains_key(&batch_id) {
            return Ok(None);
        }
        self.read_existing(batch_id)
    }

    /// Delete a batch after successful replay.
    ///
    /// Removing an id that is not queued is a no-op. Returns whether a record
    /// was removed.
    pub fn remove(&mut self, batch_id: BatchId) -> Result<bool, SpoolError> {
        self.ensure_writable()?;
        if !self.by_batch.contains_key(&batch_id) {
            return Ok(false);
        }

        match fs::remove_file(self.record_path(batch_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index_remove(batch_id);
        debug!(batch_id = %batch_id, depth = self.len(), "batch removed from local queue");
        Ok(true)
    }

    /// Persist new retry counters for a queued batch.
    ///
    /// Returns `false` without writing when the batch is no longer queued,
    /// so a removal that already happened always wins.
    pub fn update_retry_state(
        &mut self,
        batch_id: BatchId,
        state: RetryState,
    ) -> Result<bool, SpoolError> {
        self.ensure_writable()?;
        if !self.by_batch.contains_key(&batch_id) {
            return Ok(false);
        }

        let Some(mut record) = self.read_existing(batch_id)? else {
            warn!(batch_id = %batch_id, "queued record vanished from disk, dropping it from the index");
            self.index_remove(batch_id);
            return Ok(false);
        };
        record
            .batch
            .apply_retry_state(state.retry_count, state.last_error);
        record.rejection_count = record.rejection_count.max(state.rejection_count);

        let bytes = encode_record(&record)?;
        write_atomic(&self.record_path(batch_id), &bytes)?;
        self.index_insert(&record, bytes.len() as u64);
        Ok(true)
    }

    /// Remove a batch without delivering it, recording the data loss.
    pub fn evict(
        &mut self,
        batch_id: BatchId,
        reason: EvictionReason,
    ) -> Result<Option<EvictionEvent>, SpoolError> {
        self.ensure_writable()?;
        let Some(snapshot_id) = self.by_batch.get(&batch_id).copied() else {
            return Ok(None);
        };

        let last_error = match self.read_existing(batch_id) {
            Ok(Some(record)) => record.batch.last_error().map(str::to_string),
            _ => None,
        };
        let event = match self.by_snapshot.get(&snapshot_id) {
            Some(entry) => EvictionEvent {
                timestamp: Utc::now(),
                batch_id,
                local_snapshot_id: snapshot_id,
                captured_at: entry.captured_at,
                host_id: entry.host_id.clone(),
                retry_count: entry.retry_count,
                last_error,
                size_bytes: entry.size_bytes,
                reason,
            },
            None => return Ok(None),
        };

        self.remove(batch_id)?;
        if let Err(e) = self.eviction_log.record(std::slice::from_ref(&event)) {
            warn!(error = %e, "failed to persist eviction event");
        }
        Ok(Some(event))
    }

    /// Move an unreadable record aside so it stops blocking replay.
    pub fn quarantine(&mut self, batch_id: BatchId) -> Result<bool, SpoolError> {
        self.ensure_writable()?;
        if !self.by_batch.contains_key(&batch_id) {
            return Ok(false);
        }
        let path = self.record_path(batch_id);
        quarantine_file(&path)?;
        self.index_remove(batch_id);
        self.recovery.quarantined += 1;
        Ok(true)
    }

    /// Observability snapshot; `policy` decides which batches count as stuck.
    pub fn stats(&self, now: DateTime<Utc>, policy: &RetryPolicy) -> QueueStats {
        let oldest = self.by_snapshot.iter().next();
        let oldest_captured_at = oldest.map(|(_, entry)| entry.captured_at);
        QueueStats {
            depth: self.len(),
            total_bytes: self.total_bytes,
            oldest_captured_at,
            oldest_age_secs: oldest_captured_at
                .map(|ts| now.signed_duration_since(ts).num_seconds().max(0) as u64),
            oldest_local_snapshot_id: oldest.map(|(id, _)| *id),
            newest_local_snapshot_id: self.max_local_snapshot_id(),
            stuck_batches: self
                .by_snapshot
                .values()
                .filter(|entry| policy.is_stuck(entry.retry_count))
                .count(),
            stuck_threshold: policy.stuck_retry_threshold,
            limits: self.limits,
        }
    }

    fn enforce_limits(&mut self, protect: Option<BatchId>) -> Result<Vec<EvictionEvent>, SpoolError> {
        let candidates: Vec<EvictionCandidate> = self
            .by_snapshot
            .iter()
            .map(|(snapshot_id, entry)| EvictionCandidate {
                batch_id: entry.batch_id,
                local_snapshot_id: *snapshot_id,
                size_bytes: entry.size_bytes,
                retry_count: entry.retry_count,
            })
            .collect();

        let mut events = Vec::new();
        for (batch_id, reason) in plan_evictions(&candidates, self.limits, protect) {
            if let Some(event) = self.evict(batch_id, reason)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn record_path(&self, batch_id: BatchId) -> PathBuf {
        self.dir.join(format!("{}.{}", batch_id, RECORD_EXTENSION))
    }

    /// Read a record file. A file that is gone reads as `None`.
    fn read_existing(&self, batch_id: BatchId) -> Result<Option<QueuedRecord>, SpoolError> {
        let path = self.record_path(batch_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_record(&bytes)
            .map(Some)
            .map_err(|reason| SpoolError::Corrupt {
                batch_id: Some(batch_id),
                path,
                reason,
            })
    }

    /// Clear the way for `incoming` at `snapshot_id`.
    ///
    /// An older batch holding the same snapshot id would never be replayed or
    /// evicted in order, so it is evicted as data loss now. A read-only view
    /// only hides it from the index.
    fn displace_duplicate(
        &mut self,
        snapshot_id: LocalSnapshotId,
        incoming: BatchId,
    ) -> Result<Option<EvictionEvent>, SpoolError> {
        let Some(existing) = self.by_snapshot.get(&snapshot_id).map(|e| e.batch_id) else {
            return Ok(None);
        };
        if existing == incoming {
            return Ok(None);
        }
        if self.is_read_only() {
            self.index_remove(existing);
            return Ok(None);
        }
        self.evict(existing, EvictionReason::DuplicateSnapshot { kept: incoming })
    }

    /// Index a record. The snapshot slot must already be free of other batches.
    fn index_insert(&mut self, record: &QueuedRecord, size_bytes: u64) {
        let batch_id = record.batch_id();
        let snapshot_id = record.batch.local_snapshot_id();

        if let Some(previous) = self.by_batch.insert(batch_id, snapshot_id) {
            if let Some(old) = self.by_snapshot.remove(&previous) {
                self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
            }
        }

        let entry = IndexEntry {
            batch_id,
            captured_at: record.batch.timestamp(),
            host_id: record.batch.host_id().to_string(),
            size_bytes,
            retry_count: record.batch.retry_count(),
        };
        self.by_snapshot.insert(snapshot_id, entry);
        self.total_bytes += size_bytes;
    }

    fn index_remove(&mut self, batch_id: BatchId) {
        if let Some(snapshot_id) = self.by_batch.remove(&batch_id) {
            if let Some(entry) = self.by_snapshot.remove(&snapshot_id) {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
            }
        }
    }

    /// Scan the spool directory, indexing intact records and setting damaged
    /// ones aside. A read-only view changes nothing on disk.
    fn load(&mut self) -> Result<(), SpoolError> {
        let writable = !self.is_read_only();
        let mut intact = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(TEMP_SUFFIX) {
                // Interrupted before rename: the previous record (if any) is intact
                if writable {
                    fs::remove_file(&path)?;
                    self.recovery.temp_files_removed += 1;
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // Removed by the owner while a read-only view was scanning
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let damage = match decode_record(&bytes) {
                Ok(record) if name == format!("{}.{}", record.batch_id(), RECORD_EXTENSION) => {
                    intact.push((record, bytes.len() as u64));
                    continue;
                }
                Ok(_) => "record name does not match its batch id".to_string(),
                Err(reason) => reason,
            };

            if writable {
                warn!(path = %path.display(), reason = %damage, "quarantining damaged queue record");
                quarantine_file(&path)?;
                self.recovery.quarantined += 1;
            } else {
                self.recovery.unreadable += 1;
            }
        }

        // Oldest first, so a duplicate snapshot id keeps the newest record
        intact.sort_by_key(|(record, _)| record.enqueued_at);
        for (record, size) in intact {
            let snapshot_id = record.batch.local_snapshot_id();
            if self.displace_duplicate(snapshot_id, record.batch_id())?.is_some() {
                self.recovery.duplicates_evicted += 1;
            }
            self.index_insert(&record, size);
        }
        self.recovery.loaded = self.len();
        Ok(())
    }
}

/// Ordered, finite, restartable view over the queue at one point in time.
///
/// Yields `Err(SpoolError::Corrupt)` for a record that became unreadable;
/// callers decide whether to quarantine it. Records deleted after the
/// snapshot was taken are skipped.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    entries: Vec<(LocalSnapshotId, BatchId, PathBuf)>,
    position: usize,
}

impl PendingSnapshot {
    fn new(entries: Vec<(LocalSnapshotId, BatchId, PathBuf)>) -> Self {
        PendingSnapshot {
            entries,
            position: 0,
        }
    }

    /// Number of batches in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Batch ids in replay order.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.entries.iter().map(|(_, id, _)| *id).collect()
    }

    /// Rewind to the first batch.
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for PendingSnapshot {
    type Item = Result<QueuedRecord, SpoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((_, batch_id, path)) = self.entries.get(self.position) {
            self.position += 1;
            let bytes = match fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Some(Err(e.into())),
            };
            return Some(decode_record(&bytes).map_err(|reason| SpoolError::Corrupt {
                batch_id: Some(*batch_id),
                path: path.clone(),
                reason,
            }));
        }
        None
    }
}

/// Serialize a record with its integrity header.
fn encode_record(record: &QueuedRecord) -> Result<Vec<u8>, SpoolError> {
    let payload = serde_json::to_vec(record)?;
    let header = format!(
        "{} {} {}\n",
        RECORD_MAGIC,
        payload.len(),
        sha256_hex(&payload)
    );
    let mut bytes = Vec::with_capacity(header.len() + payload.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parse and verify a record. The error string names what did not match.
fn decode_record(bytes: &[u8]) -> Result<QueuedRecord, String> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| "missing header".to_string())?;
    let header = std::str::from_utf8(&bytes[..newline]).map_err(|_| "non-utf8 header".to_string())?;
    let payload = &bytes[newline + 1..];

    let mut parts = header.split(' ');
    if parts.next() != Some(RECORD_MAGIC) {
        return Err("bad magic".to_string());
    }
    let declared_len: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "bad length field".to_string())?;
    let checksum = parts.next().ok_or_else(|| "missing checksum".to_string())?;

    if payload.len() != declared_len {
        return Err(format!(
            "truncated payload: expected {} bytes, found {}",
            declared_len,
            payload.len()
        ));
    }
    if sha256_hex(payload) != checksum {
        return Err("checksum mismatch".to_string());
    }

    serde_json::from_slice(payload).map_err(|e| format!("invalid payload: {}", e))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` via a synced temp file and rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension(TEMP_SUFFIX);
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    // Persist the rename itself; not supported on every platform
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn quarantine_file(path: &Path) -> io::Result<()> {
    let target = path.with_extension(format!("{}.{}", RECORD_EXTENSION, CORRUPT_SUFFIX));
    fs::rename(path, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hw_common::{SampleCycle, SystemSnapshot};
    use tempfile::TempDir;

    fn batch(id: u64) -> TelemetryBatch {
        TelemetryBatch::new(
            LocalSnapshotId(id),
            "test-host",
            SampleCycle {
                system: Some(SystemSnapshot {
                    cpu_percent: 10.0,
                    memory_used_bytes: 100,
                    memory_total_bytes: 1000,
                    load_avg_1: 0.5,
                }),
                ..Default::default()
            },
        )
    }

    fn open(dir: &TempDir) -> DurableQueue {
        DurableQueue::open(SpoolSettings::new(dir.path().join("spool"))).unwrap()
    }

    #[test]
    fn test_enqueue_and_list_in_snapshot_order() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);

        for id in [3, 1, 2] {
            queue.enqueue(batch(id)).unwrap();
        }

        let ids: Vec<u64> = queue
            .list_pending()
            .map(|r| r.unwrap().batch.local_snapshot_id().0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(queue.len(), 3);
        assert!(queue.total_bytes() > 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let b = batch(1);
        let id = b.batch_id();
        queue.enqueue(b).unwrap();

        assert!(queue.remove(id).unwrap());
        assert!(!queue.remove(id).unwrap());
        assert!(!queue.remove(BatchId::new()).unwrap());
        assert!(queue.is_empty());
        assert_eq!(queue.total_bytes(), 0);
    }

    #[test]
    fn test_update_retry_state_persists() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let b = batch(1);
        let id = b.batch_id();
        queue.enqueue(b).unwrap();

        let updated = queue
            .update_retry_state(
                id,
                RetryState {
                    retry_count: 2,
                    last_error: Some("connection refused".to_string()),
                    rejection_count: 1,
                },
            )
            .unwrap();
        assert!(updated);

        drop(queue);
        let queue = open(&dir);
        let record = queue.get(id).unwrap().unwrap();
        assert_eq!(record.batch.retry_count(), 2);
        assert_eq!(record.batch.last_error(), Some("connection refused"));
        assert_eq!(record.rejection_count, 1);
    }

    #[test]
    fn test_update_after_remove_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let b = batch(1);
        let id = b.batch_id();
        queue.enqueue(b).unwrap();
        queue.remove(id).unwrap();

        assert!(!queue.update_retry_state(id, RetryState::default()).unwrap());
        assert!(queue.is_empty());
        let records = fs::read_dir(queue.dir())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str())
                    == Some(RECORD_EXTENSION)
            })
            .count();
        assert_eq!(records, 0);
    }

    #[test]
    fn test_snapshot_does_not_see_later_enqueues_and_skips_removed() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let first = batch(1);
        let first_id = first.batch_id();
        queue.enqueue(first).unwrap();
        queue.enqueue(batch(2)).unwrap();

        let mut snapshot = queue.list_pending();
        queue.enqueue(batch(3)).unwrap();
        queue.remove(first_id).unwrap();

        let ids: Vec<u64> = snapshot
            .by_ref()
            .map(|r| r.unwrap().batch.local_snapshot_id().0)
            .collect();
        assert_eq!(ids, vec![2]);

        snapshot.restart();
        assert_eq!(snapshot.count(), 1);
    }

    #[test]
    fn test_reopen_restores_index() {
        let dir = TempDir::new().unwrap();
        {
            let mut queue = open(&dir);
            for id in 1..=4 {
                queue.enqueue(batch(id)).unwrap();
            }
        }
        let queue = open(&dir);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.recovery().loaded, 4);
        assert_eq!(queue.max_local_snapshot_id(), Some(LocalSnapshotId(4)));
    }

    #[test]
    fn test_torn_record_is_quarantined_on_open() {
        let dir = TempDir::new().unwrap();
        let torn_id;
        {
            let mut queue = open(&dir);
            let b = batch(1);
            torn_id = b.batch_id();
            queue.enqueue(b).unwrap();
            queue.enqueue(batch(2)).unwrap();
        }

        let path = dir
            .path()
            .join("spool")
            .join(format!("{}.{}", torn_id, RECORD_EXTENSION));
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        fs::write(dir.path().join("spool").join("leftover.batch.tmp"), b"partial").unwrap();

        let queue = open(&dir);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.recovery().quarantined, 1);
        assert_eq!(queue.recovery().temp_files_removed, 1);
        assert!(!queue.contains(torn_id));
        assert!(path.with_extension("batch.corrupt").exists());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let record = QueuedRecord {
            batch: batch(1),
            rejection_count: 0,
            enqueued_at: Utc::now(),
        };
        let mut bytes = encode_record(&record).unwrap();
        let last = bytes.len() - 2;
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        let err = decode_record(&bytes).unwrap_err();
        assert!(err.contains("checksum") || err.contains("invalid payload"));
    }

    #[test]
    fn test_record_larger_than_budget_is_storage_fault() {
        let dir = TempDir::new().unwrap();
        let mut queue = DurableQueue::open(
            SpoolSettings::new(dir.path().join("spool")).with_limits(SpoolLimits {
                max_batches: 10,
                max_bytes: 16,
            }),
        )
        .unwrap();

        let err = queue.enqueue(batch(1)).unwrap_err();
        assert!(matches!(err, SpoolError::RecordTooLarge { limit: 16, .. }));
        assert!(queue.is_empty());
        let common: hw_common::Error = err.into();
        assert_eq!(common.code(), 40);
    }

    #[test]
    fn test_count_limit_evicts_and_logs() {
        let dir = TempDir::new().unwrap();
        let events_dir = dir.path().join("events");
        let mut queue = DurableQueue::open(
            SpoolSettings::new(dir.path().join("spool"))
                .with_limits(SpoolLimits {
                    max_batches: 2,
                    max_bytes: u64::MAX,
                })
                .with_event_log_dir(&events_dir),
        )
        .unwrap();

        queue.enqueue(batch(1)).unwrap();
        queue.enqueue(batch(2)).unwrap();
        let evicted = queue.enqueue(batch(3)).unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].local_snapshot_id, LocalSnapshotId(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(fs::read_dir(&events_dir).unwrap().count(), 1);
    }

    #[test]
    fn test_stats_reports_depth_age_and_stuck() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let old = TelemetryBatch::captured_at(
            LocalSnapshotId(1),
            "test-host",
            Utc::now() - chrono::Duration::minutes(10),
            SampleCycle::default(),
        );
        let old_id = old.batch_id();
        queue.enqueue(old).unwrap();
        queue.enqueue(batch(2)).unwrap();
        queue
            .update_retry_state(
                old_id,
                RetryState {
                    retry_count: 12,
                    last_error: None,
                    rejection_count: 0,
                },
            )
            .unwrap();

        let policy = RetryPolicy {
            stuck_retry_threshold: 10,
            ..RetryPolicy::default()
        };
        let stats = queue.stats(Utc::now(), &policy);
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.stuck_batches, 1);
        assert!(stats.oldest_age_secs.unwrap() >= 600);
        assert_eq!(stats.oldest_local_snapshot_id, Some(LocalSnapshotId(1)));
        assert_eq!(stats.newest_local_snapshot_id, Some(LocalSnapshotId(2)));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_owner_is_refused() {
        let dir = TempDir::new().unwrap();
        let _owner = open(&dir);

        match DurableQueue::open(SpoolSettings::new(dir.path().join("spool"))) {
            Err(SpoolError::InUse { pid, .. }) => assert_eq!(pid, Some(std::process::id())),
            Err(e) => panic!("expected InUse, got {}", e),
            Ok(_) => panic!("second owner opened the queue"),
        }
    }

    #[test]
    fn test_read_only_view_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let spool_dir = dir.path().join("spool");
        let mut owner = open(&dir);
        let b = batch(1);
        let id = b.batch_id();
        owner.enqueue(b).unwrap();
        let temp = spool_dir.join("inflight.batch.tmp");
        fs::write(&temp, b"partial").unwrap();
        fs::write(spool_dir.join("junk.batch"), b"not a record").unwrap();

        let mut view = DurableQueue::open_read_only(SpoolSettings::new(&spool_dir)).unwrap();
        assert!(view.is_read_only());
        assert_eq!(view.len(), 1);
        assert_eq!(view.recovery().unreadable, 1);
        assert!(temp.exists());
        assert!(spool_dir.join("junk.batch").exists());

        assert!(matches!(view.remove(id), Err(SpoolError::ReadOnly { .. })));
        assert!(matches!(view.enqueue(batch(2)), Err(SpoolError::ReadOnly { .. })));
        assert!(owner.contains(id));
    }

    #[test]
    fn test_read_only_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let view = DurableQueue::open_read_only(SpoolSettings::new(dir.path().join("absent"))).unwrap();
        assert!(view.is_empty());
        assert!(!dir.path().join("absent").exists());
    }

    #[test]
    fn test_vanished_record_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let b = batch(1);
        let id = b.batch_id();
        queue.enqueue(b).unwrap();
        fs::remove_file(queue.dir().join(format!("{}.{}", id, RECORD_EXTENSION))).unwrap();

        assert!(queue.get(id).unwrap().is_none());
        let updated = queue
            .update_retry_state(
                id,
                RetryState {
                    retry_count: 1,
                    last_error: Some("connection refused".to_string()),
                    rejection_count: 0,
                },
            )
            .unwrap();
        assert!(!updated);
        assert!(queue.is_empty());
        assert_eq!(queue.total_bytes(), 0);
    }

    #[test]
    fn test_duplicate_snapshot_id_evicts_older_batch() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let older = batch(7);
        let older_id = older.batch_id();
        queue.enqueue(older).unwrap();

        let newer = batch(7);
        let newer_id = newer.batch_id();
        let evicted = queue.enqueue(newer).unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].batch_id, older_id);
        assert_eq!(
            evicted[0].reason,
            EvictionReason::DuplicateSnapshot { kept: newer_id }
        );
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(newer_id));
        assert!(!queue
            .dir()
            .join(format!("{}.{}", older_id, RECORD_EXTENSION))
            .exists());
    }

    #[test]
    fn test_duplicate_snapshot_id_on_disk_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let spool_dir = dir.path().join("spool");
        fs::create_dir_all(&spool_dir).unwrap();

        let older = QueuedRecord {
            batch: batch(3),
            rejection_count: 0,
            enqueued_at: Utc::now() - chrono::Duration::minutes(5),
        };
        let newer = QueuedRecord {
            batch: batch(3),
            rejection_count: 0,
            enqueued_at: Utc::now(),
        };
        for record in [&newer, &older] {
            let path = spool_dir.join(format!("{}.{}", record.batch_id(), RECORD_EXTENSION));
            fs::write(path, encode_record(record).unwrap()).unwrap();
        }

        let queue = open(&dir);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(newer.batch_id()));
        assert_eq!(queue.recovery().duplicates_evicted, 1);
        assert_eq!(queue.recovery().loaded, 1);
        assert!(!spool_dir
            .join(format!("{}.{}", older.batch_id(), RECORD_EXTENSION))
            .exists());
    }

    #[test]
    fn test_quarantine_removes_from_index() {
        let dir = TempDir::new().unwrap();
        let mut queue = open(&dir);
        let b = batch(1);
        let id = b.batch_id();
        queue.enqueue(b).unwrap();

        assert!(queue.quarantine(id).unwrap());
        assert!(queue.is_empty());
        assert!(!queue.quarantine(id).unwrap());
    }
}
