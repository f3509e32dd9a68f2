//! Batch identity types.
//!
//! A telemetry batch carries two identities:
//! - [`BatchId`]: globally unique, used for dedup on the primary store and log correlation
//! - [`LocalSnapshotId`]: host-local sequence number, used to preserve replay order

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Globally unique batch identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Generate a new random batch ID.
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    /// Parse an existing batch ID string.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(BatchId)
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-local, strictly increasing snapshot sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalSnapshotId(pub u64);

impl LocalSnapshotId {
    /// The id that follows this one.
    pub fn next(self) -> Self {
        LocalSnapshotId(self.0.saturating_add(1))
    }
}

impl fmt::Display for LocalSnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LocalSnapshotId {
    fn from(id: u64) -> Self {
        LocalSnapshotId(id)
    }
}

/// Allocator for [`LocalSnapshotId`]s.
///
/// Ids must stay strictly increasing across restarts, so a resumed sequence
/// starts above both the highest id still sitting in the local queue and the
/// current wall clock in microseconds.
#[derive(Debug, Clone)]
pub struct SnapshotSequence {
    next: u64,
}

impl SnapshotSequence {
    /// Start a sequence at an explicit value.
    pub fn starting_at(first: u64) -> Self {
        SnapshotSequence { next: first }
    }

    /// Resume after the highest id observed in durable storage.
    pub fn resume_after(last_seen: Option<LocalSnapshotId>) -> Self {
        let after_queue = last_seen.map(|id| id.0.saturating_add(1)).unwrap_or(1);
        let clock_floor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        SnapshotSequence {
            next: after_queue.max(clock_floor),
        }
    }

    /// Allocate the next id.
    pub fn allocate(&mut self) -> LocalSnapshotId {
        let id = LocalSnapshotId(self.next);
        self.next = self.next.saturating_add(1);
        id
    }

    /// Peek at the id the next call to [`allocate`](Self::allocate) returns.
    pub fn peek(&self) -> LocalSnapshotId {
        LocalSnapshotId(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_unique() {
        let a = BatchId::new();
        let b = BatchId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_batch_id_parse_roundtrip() {
        let id = BatchId::new();
        let parsed = BatchId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert!(BatchId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_batch_id_serializes_transparent() {
        let id = BatchId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_sequence_strictly_increasing() {
        let mut seq = SnapshotSequence::starting_at(1);
        let a = seq.allocate();
        let b = seq.allocate();
        let c = seq.allocate();
        assert!(a < b && b < c);
        assert_eq!(a, LocalSnapshotId(1));
        assert_eq!(seq.peek(), LocalSnapshotId(4));
    }

    #[test]
    fn test_resume_after_queue_high_water_mark() {
        let far_future = LocalSnapshotId(u64::MAX / 2);
        let mut seq = SnapshotSequence::resume_after(Some(far_future));
        assert_eq!(seq.allocate(), far_future.next());
    }

    #[test]
    fn test_resume_uses_clock_floor() {
        let mut seq = SnapshotSequence::resume_after(Some(LocalSnapshotId(3)));
        assert!(seq.allocate().0 > 1_000_000);
    }
}
