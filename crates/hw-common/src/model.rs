//! Telemetry batch model.
//!
//! A [`TelemetryBatch`] is the atomic unit of persistence for one sampling
//! cycle: the system snapshot, the process list, and the temperature reading
//! commit together or not at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{BatchId, LocalSnapshotId};

/// Aggregate CPU and memory usage for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Host-wide CPU utilisation (0-100).
    pub cpu_percent: f32,

    /// Memory in use, in bytes.
    pub memory_used_bytes: u64,

    /// Total physical memory, in bytes.
    pub memory_total_bytes: u64,

    /// One-minute load average.
    pub load_avg_1: f64,
}

/// Per-process resource usage record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID.
    pub pid: u32,

    /// Command name (comm).
    pub name: String,

    /// CPU percentage over the sampling window (0-100+ on multi-core hosts).
    pub cpu_percent: f32,

    /// Resident memory in bytes.
    pub memory_bytes: u64,

    /// Number of threads.
    pub thread_count: u32,
}

/// CPU temperature reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTemperature {
    /// Degrees Celsius.
    pub celsius: f32,

    /// Sensor label (e.g. `x86_pkg_temp`).
    pub sensor: String,
}

/// Raw output of one sampling cycle, before identities are assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleCycle {
    pub system: Option<SystemSnapshot>,
    pub processes: Vec<ProcessInfo>,
    pub temperature: Option<CpuTemperature>,
}

/// One sampling cycle's telemetry, persisted atomically.
///
/// Everything except the retry counters is fixed at construction. The
/// counters only move forward: [`apply_retry_state`](Self::apply_retry_state)
/// never lowers `retry_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    batch_id: BatchId,
    local_snapshot_id: LocalSnapshotId,
    timestamp: DateTime<Utc>,
    host_id: String,
    #[serde(default)]
    system: Option<SystemSnapshot>,
    #[serde(default)]
    processes: Vec<ProcessInfo>,
    #[serde(default)]
    temperature: Option<CpuTemperature>,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    last_error: Option<String>,
}

impl TelemetryBatch {
    /// Create a batch captured now.
    pub fn new(
        local_snapshot_id: LocalSnapshotId,
        host_id: impl Into<String>,
        cycle: SampleCycle,
    ) -> Self {
        Self::captured_at(local_snapshot_id, host_id, Utc::now(), cycle)
    }

    /// Create a batch with an explicit capture time.
    pub fn captured_at(
        local_snapshot_id: LocalSnapshotId,
        host_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        cycle: SampleCycle,
    ) -> Self {
        TelemetryBatch {
            batch_id: BatchId::new(),
            local_snapshot_id,
            timestamp,
            host_id: host_id.into(),
            system: cycle.system,
            processes: cycle.processes,
            temperature: cycle.temperature,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_snapshot_id(&self) -> LocalSnapshotId {
        self.local_snapshot_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn system(&self) -> Option<&SystemSnapshot> {
        self.system.as_ref()
    }

    pub fn processes(&self) -> &[ProcessInfo] {
        &self.processes
    }

    pub fn temperature(&self) -> Option<&CpuTemperature> {
        self.temperature.as_ref()
    }

    /// Failed replay attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Description of the most recent failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record retry bookkeeping. Called by the local queue only.
    pub fn apply_retry_state(&mut self, retry_count: u32, last_error: Option<String>) {
        self.retry_count = self.retry_count.max(retry_count);
        self.last_error = last_error;
    }

    /// Check that every measurement is representable by a relational store.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidBatch {
            batch_id: self.batch_id.to_string(),
            reason,
        };

        if self.host_id.trim().is_empty() {
            return Err(invalid("empty host_id".to_string()));
        }

        if let Some(system) = &self.system {
            if !system.cpu_percent.is_finite() || system.cpu_percent < 0.0 {
                return Err(invalid(format!("system cpu_percent {}", system.cpu_percent)));
            }
            if !system.load_avg_1.is_finite() || system.load_avg_1 < 0.0 {
                return Err(invalid(format!("load_avg_1 {}", system.load_avg_1)));
            }
            if system.memory_used_bytes > system.memory_total_bytes {
                return Err(invalid(format!(
                    "memory_used_bytes {} exceeds memory_total_bytes {}",
                    system.memory_used_bytes, system.memory_total_bytes
                )));
            }
        }

        for proc_info in &self.processes {
            if !proc_info.cpu_percent.is_finite() || proc_info.cpu_percent < 0.0 {
                return Err(invalid(format!(
                    "pid {} cpu_percent {}",
                    proc_info.pid, proc_info.cpu_percent
                )));
            }
        }

        if let Some(temp) = &self.temperature {
            if !temp.celsius.is_finite() || !(-100.0..=250.0).contains(&temp.celsius) {
                return Err(invalid(format!("temperature {}C", temp.celsius)));
            }
        }

        Ok(())
    }
}
