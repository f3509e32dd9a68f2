//! hostwatch common types, IDs, and errors.
//!
//! This crate provides foundational types shared across hostwatch crates:
//! - The telemetry batch model produced once per sampling cycle
//! - Batch identity types
//! - Common error types
//! - Configuration loading and validation

pub mod config;
pub mod error;
pub mod id;
pub mod model;

pub use config::{ConfigPaths, ConfigResolver, ConfigSource, HostwatchConfig};
pub use error::{Error, ErrorCategory, Result};
pub use id::{BatchId, LocalSnapshotId, SnapshotSequence};
pub use model::{CpuTemperature, ProcessInfo, SampleCycle, SystemSnapshot, TelemetryBatch};

/// Version of the on-disk record and primary-store document formats.
pub const SCHEMA_VERSION: &str = "1.0.0";
