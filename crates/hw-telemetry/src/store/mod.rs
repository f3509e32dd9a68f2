//! Primary store contract and adapters.
//!
//! The resilient writer only sees the [`PrimaryStore`] trait. Concrete stores:
//! - [`DirectoryStore`]: JSON documents partitioned by host and day under a root directory
//! - [`MemoryStore`]: in-process store with failure injection (dry runs and tests)
//!
//! [`TimeoutStore`] bounds every `write_batch` call.

pub mod directory;
pub mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hw_common::TelemetryBatch;
use thiserror::Error;
use tracing::{debug, warn};

/// Why the primary store did not accept a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable or failing for reasons unrelated to the batch.
    #[error("primary store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured bound.
    #[error("primary store call timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The store refused this batch's content.
    #[error("primary store rejected batch: {0}")]
    Rejected(String),
}

/// How the writer reacts to a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connectivity problem; every later batch would fail the same way.
    Transient,
    /// Specific to this batch; later batches may still succeed.
    Rejected,
}

impl StoreError {
    pub fn class(&self) -> FailureClass {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout { .. } => FailureClass::Transient,
            StoreError::Rejected(_) => FailureClass::Rejected,
        }
    }
}

impl From<StoreError> for hw_common::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => hw_common::Error::PrimaryUnavailable(reason),
            StoreError::Timeout { millis } => hw_common::Error::PrimaryTimeout { millis },
            StoreError::Rejected(reason) => hw_common::Error::BatchRejected {
                batch_id: String::new(),
                reason,
            },
        }
    }
}

/// The durable, queryable backend telemetry is ultimately read from.
///
/// `write_batch` must be an upsert keyed on the batch's `BatchId`: writing the
/// same batch twice leaves exactly one record.
pub trait PrimaryStore: Send + Sync {
    fn write_batch(&self, batch: &TelemetryBatch) -> Result<(), StoreError>;

    /// Cheap health check. Not a substitute for handling write failures.
    fn is_reachable(&self) -> bool;
}

impl<S: PrimaryStore + ?Sized> PrimaryStore for Arc<S> {
    fn write_batch(&self, batch: &TelemetryBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }

    fn is_reachable(&self) -> bool {
        (**self).is_reachable()
    }
}

/// Bounds each `write_batch` on the wrapped store.
///
/// The call runs on a worker thread; if no answer arrives within the
/// timeout the caller gets [`StoreError::Timeout`] and the worker is left to
/// finish in the background. A late completion is harmless because writes are
/// upserts, and the batch stays queued until a confirmed write removes it.
pub struct TimeoutStore<S: ?Sized> {
    inner: Arc<S>,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
}

impl<S: PrimaryStore + ?Sized + 'static> TimeoutStore<S> {
    pub fn new(inner: Arc<S>, timeout: Duration) -> Self {
        TimeoutStore {
            inner,
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_error(&self) -> StoreError {
        StoreError::Timeout {
            millis: self.timeout.as_millis() as u64,
        }
    }
}

impl<S: PrimaryStore + ?Sized + 'static> PrimaryStore for TimeoutStore<S> {
    fn write_batch(&self, batch: &TelemetryBatch) -> Result<(), StoreError> {
        // A stalled call from an earlier attempt is still running; piling more
        // threads onto a hung store would not help
        if self.in_flight.load(Ordering::Acquire) {
            debug!(batch_id = %batch.batch_id(), "previous primary store call still in flight");
            return Err(self.timeout_error());
        }

        let (tx, rx) = mpsc::channel();
        let store = Arc::clone(&self.inner);
        let in_flight = Arc::clone(&self.in_flight);
        let owned = batch.clone();
        in_flight.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("hw-store-call".to_string())
            .spawn(move || {
                let result = store.write_batch(&owned);
                in_flight.store(false, Ordering::Release);
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            self.in_flight.store(false, Ordering::Release);
            return Err(StoreError::Unavailable(format!(
                "failed to spawn store worker: {}",
                e
            )));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    batch_id = %batch.batch_id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "primary store call timed out"
                );
                Err(self.timeout_error())
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StoreError::Unavailable(
                "store worker exited without a result".to_string(),
            )),
        }
    }

    fn is_reachable(&self) -> bool {
        !self.in_flight.load(Ordering::Acquire) && self.inner.is_reachable()
    }
}
