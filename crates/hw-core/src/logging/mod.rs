//! Structured logging for the hostwatch daemon.
//!
//! - Human-readable console output for interactive use
//! - JSON lines for supervised deployments (`--log-format jsonl`)
//!
//! stdout is reserved for command payloads (status JSON); all logs go to stderr.
//!
//! Stable targets worth alerting on:
//! - `hostwatch::data_loss`: a queued batch was evicted
//! - `hostwatch::storage_fault`: the local queue could not be written
//! - `hostwatch::replay`: replay cycle summaries

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::io::IsTerminal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates and targets whose events are shown at the configured level.
const LOG_TARGETS: &[&str] = &["hostwatch", "hw_core", "hw_telemetry", "hw_common"];

/// Targets that stay visible at warn under `--quiet`. Only `off` silences them.
const ALERT_TARGETS: &[&str] = &["hostwatch::data_loss", "hostwatch::storage_fault"];

/// Filter directive for `level` across all hostwatch targets.
pub fn default_directive(level: LogLevel) -> String {
    let mut directives: Vec<String> = LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect();
    if level.hides_warnings() && level != LogLevel::Off {
        directives.extend(ALERT_TARGETS.iter().map(|target| format!("{}=warn", target)));
    }
    directives.join(",")
}

/// Initialize the logging subsystem.
///
/// `RUST_LOG` is honoured only when no level was chosen by flag or
/// `HOSTWATCH_LOG`. Calling this twice is harmless; the second subscriber is
/// ignored.
pub fn init_logging(config: &LogConfig) {
    let rust_log = if config.explicit_level {
        None
    } else {
        EnvFilter::try_from_default_env().ok()
    };
    let filter = rust_log.unwrap_or_else(|| EnvFilter::new(default_directive(config.level)));

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(use_ansi);

            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_target(true)
                .with_thread_names(true)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
        }
    };

    if let Err(e) = result {
        eprintln!("hostwatch: logging already initialized: {}", e);
    }
}

/// Best-effort stable identifier for this host.
///
/// Prefers the kernel hostname, then `$HOSTNAME`, then a prefix of
/// `/etc/machine-id`, then a random id.
pub fn detect_host_id() -> String {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = std::fs::read_to_string(path) {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if id.len() >= 8 {
            return format!("host-{}", &id[..8]);
        }
    }

    format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_covers_all_targets() {
        let directive = default_directive(LogLevel::Debug);
        assert_eq!(
            directive,
            "hostwatch=debug,hw_core=debug,hw_telemetry=debug,hw_common=debug"
        );
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn test_quiet_keeps_data_loss_visible() {
        let directive = default_directive(LogLevel::Error);
        assert!(directive.contains("hostwatch::data_loss=warn"));
        assert!(directive.contains("hostwatch::storage_fault=warn"));
        assert!(EnvFilter::try_new(&directive).is_ok());

        assert!(!default_directive(LogLevel::Warn).contains("data_loss"));
    }

    #[test]
    fn test_off_silences_everything() {
        let directive = default_directive(LogLevel::Off);
        assert!(!directive.contains("data_loss"));
        assert!(EnvFilter::try_new(directive).is_ok());
    }

    #[test]
    fn test_detect_host_id_non_empty() {
        let host = detect_host_id();
        assert!(!host.trim().is_empty());
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        let config = LogConfig::default().with_level(LogLevel::Off);
        init_logging(&config);
        init_logging(&config);
    }
}
