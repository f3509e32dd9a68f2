//! The hostwatch daemon: a sampling loop and a replay loop over one writer.
//!
//! - **Sampling**: every `sampling.interval_secs`, take one [`Sampler`] cycle,
//!   stamp it with a fresh `LocalSnapshotId`, and hand it to
//!   [`ResilientWriter::write`].
//! - **Replay**: every `replay.interval_secs`, drain the local queue with
//!   [`ResilientWriter::replay_pending`].
//!
//! Both loops run on named threads sharing one shutdown flag. The per-tick
//! functions ([`sample_tick`], [`replay_tick`]) are synchronous and testable
//! on their own.

#[cfg(feature = "metrics")]
pub mod metrics;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use hw_common::{HostwatchConfig, SnapshotSequence, TelemetryBatch};
use hw_telemetry::{HealthStatus, ReplayReport, ResilientWriter, WriteOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::collect::Sampler;

#[cfg(feature = "metrics")]
use metrics::HostwatchMetrics;

/// Events kept in [`DaemonState::recent_events`].
const RECENT_EVENT_CAPACITY: usize = 100;

/// Longest single sleep between shutdown checks.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing and identity for the daemon loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub sample_interval: Duration,
    pub replay_interval: Duration,
    pub host_id: String,
}

impl DaemonSettings {
    pub fn from_config(config: &HostwatchConfig, host_id: impl Into<String>) -> Self {
        DaemonSettings {
            sample_interval: Duration::from_secs(config.sampling.interval_secs),
            replay_interval: Duration::from_secs(config.replay.interval_secs),
            host_id: host_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon state
// ---------------------------------------------------------------------------

/// A daemon event for status output and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonEvent {
    pub timestamp: String,
    pub event_type: DaemonEventType,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonEventType {
    Started,
    Stopped,
    SampleCompleted,
    SampleFailed,
    PersistenceFailed,
    ReplayCompleted,
    DataLoss,
    HealthDegraded,
}

/// Running counters for both loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub started_at: String,
    pub sample_count: u64,
    pub sample_failures: u64,
    pub last_sample_at: Option<String>,
    pub replay_count: u64,
    pub last_replay_at: Option<String>,
    pub persisted: u64,
    pub enqueued: u64,
    pub lost: u64,
    pub replayed: u64,
    pub evicted: u64,
    /// Recent events for audit.
    pub recent_events: VecDeque<DaemonEvent>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now().to_rfc3339(),
            sample_count: 0,
            sample_failures: 0,
            last_sample_at: None,
            replay_count: 0,
            last_replay_at: None,
            persisted: 0,
            enqueued: 0,
            lost: 0,
            replayed: 0,
            evicted: 0,
            recent_events: VecDeque::with_capacity(RECENT_EVENT_CAPACITY),
        }
    }

    pub fn record_event(&mut self, event_type: DaemonEventType, detail: &str) {
        let event = DaemonEvent {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            detail: detail.to_string(),
        };
        if self.recent_events.len() >= RECENT_EVENT_CAPACITY {
            self.recent_events.pop_front();
        }
        self.recent_events.push_back(event);
    }

    /// Fold the counters and events of one tick's scratch state into this one.
    pub fn absorb(&mut self, tick: DaemonState) {
        self.sample_count += tick.sample_count;
        self.sample_failures += tick.sample_failures;
        self.last_sample_at = tick.last_sample_at.or(self.last_sample_at.take());
        self.replay_count += tick.replay_count;
        self.last_replay_at = tick.last_replay_at.or(self.last_replay_at.take());
        self.persisted += tick.persisted;
        self.enqueued += tick.enqueued;
        self.lost += tick.lost;
        self.replayed += tick.replayed;
        self.evicted += tick.evicted;
        for event in tick.recent_events {
            if self.recent_events.len() >= RECENT_EVENT_CAPACITY {
                self.recent_events.pop_front();
            }
            self.recent_events.push_back(event);
        }
    }

    fn record_health(&mut self, health: HealthStatus) {
        if let HealthStatus::Degraded { consecutive_faults } = health {
            self.record_event(
                DaemonEventType::HealthDegraded,
                &format!("{} consecutive local storage faults", consecutive_faults),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Ticks (synchronous, testable)
// ---------------------------------------------------------------------------

/// Run one sampling cycle.
///
/// Returns `None` when the sampler produced nothing; no snapshot id is spent
/// on a failed sample.
pub fn sample_tick(
    sampler: &mut dyn Sampler,
    sequence: &mut SnapshotSequence,
    host_id: &str,
    writer: &ResilientWriter,
    cancel: &AtomicBool,
    state: &mut DaemonState,
) -> Option<WriteOutcome> {
    let cycle = match sampler.sample() {
        Ok(cycle) => cycle,
        Err(e) => {
            state.sample_failures += 1;
            warn!(error = %e, "sampling failed; skipping cycle");
            state.record_event(DaemonEventType::SampleFailed, &e.to_string());
            return None;
        }
    };

    let batch = TelemetryBatch::new(sequence.allocate(), host_id, cycle);
    let local_snapshot_id = batch.local_snapshot_id();
    let outcome = writer.write(batch, cancel);

    state.sample_count += 1;
    state.last_sample_at = Some(Utc::now().to_rfc3339());

    match &outcome {
        WriteOutcome::Persisted => {
            state.persisted += 1;
            debug!(local_snapshot_id = %local_snapshot_id, "sample persisted");
        }
        WriteOutcome::Enqueued { reason, evicted } => {
            state.enqueued += 1;
            state.evicted += evicted.len() as u64;
            debug!(local_snapshot_id = %local_snapshot_id, reason = ?reason, "sample queued");
            for event in evicted {
                state.record_event(
                    DaemonEventType::DataLoss,
                    &format!("evicted {} ({})", event.batch_id, event.reason.label()),
                );
            }
        }
        WriteOutcome::Failed(failure) => {
            state.lost += 1;
            state.record_event(DaemonEventType::PersistenceFailed, &failure.to_string());
            state.record_health(writer.health().status());
        }
    }
    state.record_event(
        DaemonEventType::SampleCompleted,
        &format!("snapshot {} {}", local_snapshot_id, outcome.label()),
    );

    Some(outcome)
}

/// Run one replay cycle.
pub fn replay_tick(
    writer: &ResilientWriter,
    cancel: &AtomicBool,
    state: &mut DaemonState,
) -> ReplayReport {
    let report = writer.replay_pending(cancel);

    state.replay_count += 1;
    state.last_replay_at = Some(Utc::now().to_rfc3339());
    state.replayed += report.replayed.len() as u64;
    state.evicted += report.evicted.len() as u64;

    for event in &report.evicted {
        state.record_event(
            DaemonEventType::DataLoss,
            &format!("evicted {} ({})", event.batch_id, event.reason.label()),
        );
    }
    if report.storage_fault.is_some() {
        state.record_health(writer.health().status());
    }
    if report.pending_at_start > 0 {
        state.record_event(
            DaemonEventType::ReplayCompleted,
            &format!(
                "replayed {} of {}, {} remaining",
                report.replayed.len(),
                report.pending_at_start,
                report.remaining
            ),
        );
    }

    report
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Errors that stop the daemon itself.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// Owns the writer and runs both loops until shutdown.
pub struct Daemon {
    writer: Arc<ResilientWriter>,
    settings: DaemonSettings,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<DaemonState>>,
    #[cfg(feature = "metrics")]
    metrics: Option<HostwatchMetrics>,
}

impl Daemon {
    pub fn new(
        writer: Arc<ResilientWriter>,
        settings: DaemonSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Daemon {
            writer,
            settings,
            shutdown,
            state: Arc::new(Mutex::new(DaemonState::new())),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: HostwatchMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until the shutdown flag is set. Returns the final state.
    ///
    /// One replay cycle runs immediately so a backlog left by a previous
    /// process starts draining before the first replay interval elapses.
    pub fn run<S>(self, sampler: S, sequence: SnapshotSequence) -> Result<DaemonState, DaemonError>
    where
        S: Sampler + 'static,
    {
        lock_state(&self.state).record_event(DaemonEventType::Started, &self.settings.host_id);
        info!(
            host_id = %self.settings.host_id,
            sample_interval_secs = self.settings.sample_interval.as_secs(),
            replay_interval_secs = self.settings.replay_interval.as_secs(),
            first_snapshot_id = %sequence.peek(),
            "daemon started"
        );

        let replay = self.spawn_replay_loop()?;
        let sampler = match self.spawn_sampler_loop(sampler, sequence) {
            Ok(handle) => handle,
            Err(e) => {
                self.shutdown.store(true, Ordering::SeqCst);
                let _ = replay.join();
                return Err(e);
            }
        };

        let sampler_result = sampler.join();
        let replay_result = replay.join();
        if sampler_result.is_err() {
            return Err(DaemonError::ThreadPanicked("hw-sampler"));
        }
        if replay_result.is_err() {
            return Err(DaemonError::ThreadPanicked("hw-replay"));
        }

        let mut state = lock_state(&self.state);
        state.record_event(DaemonEventType::Stopped, "shutdown requested");
        info!(
            samples = state.sample_count,
            persisted = state.persisted,
            enqueued = state.enqueued,
            replayed = state.replayed,
            evicted = state.evicted,
            lost = state.lost,
            "daemon stopped"
        );
        Ok(state.clone())
    }

    fn spawn_sampler_loop<S>(
        &self,
        mut sampler: S,
        mut sequence: SnapshotSequence,
    ) -> Result<thread::JoinHandle<()>, DaemonError>
    where
        S: Sampler + 'static,
    {
        let writer = self.writer.clone();
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let host_id = self.settings.host_id.clone();
        let interval = self.settings.sample_interval;
        #[cfg(feature = "metrics")]
        let metrics = self.metrics.clone();

        thread::Builder::new()
            .name("hw-sampler".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    // The write may wait out a full store timeout; the replay
                    // loop must not queue behind it for the state lock.
                    let mut scratch = DaemonState::new();
                    let outcome = sample_tick(
                        &mut sampler,
                        &mut sequence,
                        &host_id,
                        &writer,
                        &shutdown,
                        &mut scratch,
                    );
                    lock_state(&state).absorb(scratch);
                    #[cfg(feature = "metrics")]
                    {
                        if let (Some(metrics), Some(outcome)) = (&metrics, &outcome) {
                            metrics.record_write(outcome);
                            metrics.update_queue(&writer.queue_stats(Utc::now()));
                            metrics
                                .set_healthy(writer.health().status() == HealthStatus::Healthy);
                        }
                    }
                    #[cfg(not(feature = "metrics"))]
                    let _ = outcome;

                    sleep_until_next(started, interval, &shutdown);
                }
                debug!("sampler loop exited");
            })
            .map_err(|source| DaemonError::Spawn {
                name: "hw-sampler",
                source,
            })
    }

    fn spawn_replay_loop(&self) -> Result<thread::JoinHandle<()>, DaemonError> {
        let writer = self.writer.clone();
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let interval = self.settings.replay_interval;
        #[cfg(feature = "metrics")]
        let metrics = self.metrics.clone();

        thread::Builder::new()
            .name("hw-replay".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    let mut scratch = DaemonState::new();
                    let report = replay_tick(&writer, &shutdown, &mut scratch);
                    lock_state(&state).absorb(scratch);

                    #[cfg(feature = "metrics")]
                    {
                        if let Some(metrics) = &metrics {
                            metrics.record_replay(&report);
                            metrics.update_queue(&writer.queue_stats(Utc::now()));
                            metrics
                                .set_healthy(writer.health().status() == HealthStatus::Healthy);
                        }
                    }
                    #[cfg(not(feature = "metrics"))]
                    let _ = report;

                    sleep_until_next(started, interval, &shutdown);
                }
                debug!("replay loop exited");
            })
            .map_err(|source| DaemonError::Spawn {
                name: "hw-replay",
                source,
            })
    }
}

fn lock_state(state: &Mutex<DaemonState>) -> std::sync::MutexGuard<'_, DaemonState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sleep out the rest of `interval`, waking early on shutdown.
fn sleep_until_next(started: Instant, interval: Duration, shutdown: &AtomicBool) {
    let deadline = started + interval;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// Set `shutdown` on SIGINT/SIGTERM.
pub fn install_shutdown_handler(shutdown: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown requested; finishing current cycle");
    })
}
