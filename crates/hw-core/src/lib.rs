//! hostwatch daemon library.
//!
//! Sampling, the sampling and replay loops, logging setup, and exit codes.
//! Persistence lives in `hw-telemetry`.

pub mod collect;
pub mod daemon;
pub mod exit_codes;
pub mod logging;

pub use collect::{CollectError, ProcfsSampler, Sampler, StaticSampler};
pub use daemon::{Daemon, DaemonError, DaemonSettings, DaemonState};
pub use exit_codes::ExitCode;
