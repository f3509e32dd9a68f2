//! Telemetry sampling.
//!
//! A [`Sampler`] produces the raw measurements for one cycle. Identities
//! (`BatchId`, `LocalSnapshotId`) and the capture timestamp are assigned by
//! the daemon, not the sampler.

pub mod procfs;

pub use procfs::ProcfsSampler;

use hw_common::SampleCycle;
use thiserror::Error;

/// Errors from sampling.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("sampler failed: {0}")]
    Failed(String),

    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),
}

impl From<CollectError> for hw_common::Error {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::Unavailable(reason) => hw_common::Error::UnsupportedPlatform(reason),
            other => hw_common::Error::Collection(other.to_string()),
        }
    }
}

/// Source of one cycle of measurements.
pub trait Sampler: Send {
    fn sample(&mut self) -> Result<SampleCycle, CollectError>;
}

/// Replays a fixed cycle. Used for `--dry-run` style smoke runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSampler {
    cycle: SampleCycle,
}

impl StaticSampler {
    pub fn new(cycle: SampleCycle) -> Self {
        StaticSampler { cycle }
    }
}

impl Sampler for StaticSampler {
    fn sample(&mut self) -> Result<SampleCycle, CollectError> {
        Ok(self.cycle.clone())
    }
}
