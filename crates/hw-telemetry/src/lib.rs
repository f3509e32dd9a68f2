//! hostwatch resilient persistence layer.
//!
//! This crate provides:
//! - A durable, bounded local queue for batches the primary store could not take
//! - Single-owner locking of the queue directory
//! - Capacity enforcement with audited eviction
//! - The primary store contract, with directory-backed and in-memory stores
//! - The replay policy and the resilient writer that ties them together

pub mod lockfile;
pub mod policy;
pub mod retention;
pub mod spool;
pub mod store;
pub mod writer;

pub use lockfile::SpoolLock;
pub use policy::{ReplayDecision, RetryPolicy};
pub use retention::{EvictionEvent, EvictionLog, EvictionReason, SpoolLimits};
pub use spool::{
    DurableQueue, PendingSnapshot, QueueStats, QueuedRecord, RecoveryReport, RetryState,
    SharedSpool, SpoolError, SpoolSettings,
};
pub use store::{
    DirectoryStore, FailureClass, MemoryStore, PrimaryStore, StoreError, TimeoutStore,
};
pub use writer::{
    EnqueueReason, HealthMonitor, HealthStatus, PersistenceFailed, ReplayReport, ResilientWriter,
    WriteOutcome,
};
