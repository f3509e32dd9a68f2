//! Configuration loading and validation for hostwatch.
//!
//! This module provides:
//! - Typed configuration sections (sampling, replay, spool, primary, health, metrics)
//! - Deterministic config resolution (CLI > env > XDG > defaults)
//! - Semantic validation

pub mod resolve;

pub use resolve::{ConfigPaths, ConfigResolver};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The complete hostwatch configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostwatchConfig {
    pub sampling: SamplingConfig,
    pub replay: ReplayConfig,
    pub spool: SpoolConfig,
    pub primary: PrimaryConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
}

/// Sampler cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Seconds between sampling cycles.
    pub interval_secs: u64,

    /// Host identifier stamped on every batch. Detected when absent.
    pub host_id: Option<String>,

    /// Maximum number of processes recorded per cycle (highest CPU first).
    pub max_processes: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            interval_secs: 5,
            host_id: None,
            max_processes: 200,
        }
    }
}

/// Replay cadence and primary-store call limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Seconds between replay cycles, independent of the sampling interval.
    pub interval_secs: u64,

    /// Upper bound on a single primary-store call.
    pub store_timeout_ms: u64,

    /// Rejections tolerated before a batch is evicted as poison.
    pub rejection_ceiling: u32,

    /// Batches with more failed replays than this are reported as stuck.
    pub stuck_retry_threshold: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            interval_secs: 30,
            store_timeout_ms: 5_000,
            rejection_ceiling: 5,
            stuck_retry_threshold: 10,
        }
    }
}

/// Durable local queue location and bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory holding one record per queued batch.
    pub dir: PathBuf,

    /// Maximum number of queued batches. 0 is rejected by validation.
    pub max_batches: usize,

    /// Maximum total bytes of queued records. 0 is rejected by validation.
    pub max_bytes: u64,

    /// Where eviction events are appended as JSON lines.
    pub event_log_dir: Option<PathBuf>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        SpoolConfig {
            dir: default_data_dir().join("spool"),
            max_batches: 10_000,
            max_bytes: 256 * 1024 * 1024, // 256 MiB
            event_log_dir: Some(default_data_dir().join("events")),
        }
    }
}

/// Directory-backed primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryConfig {
    /// Root of the primary store (typically a mounted network share).
    pub dir: PathBuf,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        PrimaryConfig {
            dir: default_data_dir().join("primary"),
        }
    }
}

/// Health escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive cycles with a local storage fault before the daemon reports unhealthy.
    pub storage_fault_escalation_cycles: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            storage_fault_escalation_cycles: 3,
        }
    }
}

/// Prometheus endpoint (only served when built with the `metrics` feature).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 9187,
        }
    }
}

impl HostwatchConfig {
    /// Validate configuration semantically.
    pub fn validate(&self) -> Result<()> {
        fn positive(field: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(Error::InvalidConfig {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("sampling.interval_secs", self.sampling.interval_secs)?;
        positive("sampling.max_processes", self.sampling.max_processes as u64)?;
        positive("replay.interval_secs", self.replay.interval_secs)?;
        positive("replay.store_timeout_ms", self.replay.store_timeout_ms)?;
        positive("replay.rejection_ceiling", u64::from(self.replay.rejection_ceiling))?;
        positive("spool.max_batches", self.spool.max_batches as u64)?;
        positive("spool.max_bytes", self.spool.max_bytes)?;
        positive(
            "health.storage_fault_escalation_cycles",
            u64::from(self.health.storage_fault_escalation_cycles),
        )?;

        if self.spool.dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                field: "spool.dir".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.spool.dir == self.primary.dir {
            return Err(Error::InvalidConfig {
                field: "primary.dir".to_string(),
                reason: "must differ from spool.dir".to_string(),
            });
        }
        if let Some(host_id) = &self.sampling.host_id {
            if host_id.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    field: "sampling.host_id".to_string(),
                    reason: "must not be blank".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration source for a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Path to the config file, or None if using defaults
    pub path: Option<String>,
    /// SHA-256 hash of file contents, or None if defaults
    pub hash: Option<String>,
    /// How this source was resolved
    pub resolution: ConfigResolution,
}

/// How a config file was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigResolution {
    /// From explicit CLI flag
    CliFlag,
    /// From environment variable
    EnvVar,
    /// From XDG config directory
    XdgConfig,
    /// Using built-in defaults
    Default,
}

impl std::fmt::Display for ConfigResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigResolution::CliFlag => write!(f, "cli"),
            ConfigResolution::EnvVar => write!(f, "env"),
            ConfigResolution::XdgConfig => write!(f, "xdg"),
            ConfigResolution::Default => write!(f, "default"),
        }
    }
}

/// Base directory for hostwatch's local state.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostwatch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = HostwatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.replay.rejection_ceiling, 5);
        assert_eq!(config.spool.max_batches, 10_000);
        assert!(config.spool.dir.ends_with("spool"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = HostwatchConfig::default();
        config.replay.interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("replay.interval_secs"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = HostwatchConfig::default();
        config.spool.max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spool_and_primary_must_differ() {
        let mut config = HostwatchConfig::default();
        config.primary.dir = config.spool.dir.clone();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("primary.dir"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: HostwatchConfig =
            serde_json::from_str(r#"{"replay": {"interval_secs": 60}}"#).unwrap();
        assert_eq!(config.replay.interval_secs, 60);
        assert_eq!(config.replay.store_timeout_ms, 5_000);
        assert_eq!(config.sampling.interval_secs, 5);
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(ConfigResolution::CliFlag.to_string(), "cli");
        assert_eq!(ConfigResolution::Default.to_string(), "default");
    }
}
