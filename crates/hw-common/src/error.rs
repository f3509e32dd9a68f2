//! Error types for hostwatch.
//!
//! Every error carries:
//! - A stable numeric code for machine parsing
//! - A category for grouping
//! - A recoverability hint
//! - A remediation suggestion for operators
//!
//! # Human-Facing Output
//!
//! ```text
//! ✗ Local Queue Storage Fault
//!   Reason: local queue storage fault: No space left on device (os error 28)
//!   Fix: Free disk space under the spool directory or point spool.dir elsewhere.
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for hostwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file errors.
    Config,
    /// Telemetry sampling errors.
    Collection,
    /// Telemetry batch content errors.
    Model,
    /// Durable local queue errors.
    Spool,
    /// Primary store errors.
    Primary,
    /// File I/O and serialization errors.
    Io,
    /// Platform compatibility errors.
    Platform,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Collection => write!(f, "collection"),
            ErrorCategory::Model => write!(f, "model"),
            ErrorCategory::Spool => write!(f, "spool"),
            ErrorCategory::Primary => write!(f, "primary"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Platform => write!(f, "platform"),
        }
    }
}

/// Unified error type for hostwatch.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Collection errors (20-29)
    #[error("telemetry collection failed: {0}")]
    Collection(String),

    // Model errors (30-39)
    #[error("malformed telemetry batch {batch_id}: {reason}")]
    InvalidBatch { batch_id: String, reason: String },

    // Spool errors (40-49)
    #[error("local queue storage fault: {0}")]
    StorageFault(String),

    #[error("corrupt queue record {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("local queue {dir} is in use by another hostwatch process{}", holder_suffix(.pid))]
    SpoolInUse { dir: String, pid: Option<u32> },

    // Primary store errors (50-59)
    #[error("primary store unavailable: {0}")]
    PrimaryUnavailable(String),

    #[error("primary store timed out after {millis}ms")]
    PrimaryTimeout { millis: u64 },

    #[error("primary store rejected batch {batch_id}: {reason}")]
    BatchRejected { batch_id: String, reason: String },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Platform errors (70-79)
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

fn holder_suffix(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {})", pid)).unwrap_or_default()
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Collection errors
    /// - 30-39: Model errors
    /// - 40-49: Spool errors
    /// - 50-59: Primary store errors
    /// - 60-69: I/O errors
    /// - 70-79: Platform errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidConfig { .. } => 11,
            Error::Collection(_) => 20,
            Error::InvalidBatch { .. } => 30,
            Error::StorageFault(_) => 40,
            Error::CorruptRecord { .. } => 41,
            Error::SpoolInUse { .. } => 42,
            Error::PrimaryUnavailable(_) => 50,
            Error::PrimaryTimeout { .. } => 51,
            Error::BatchRejected { .. } => 52,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::UnsupportedPlatform(_) => 70,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidConfig { .. } => ErrorCategory::Config,

            Error::Collection(_) => ErrorCategory::Collection,

            Error::InvalidBatch { .. } => ErrorCategory::Model,

            Error::StorageFault(_) | Error::CorruptRecord { .. } | Error::SpoolInUse { .. } => {
                ErrorCategory::Spool
            }

            Error::PrimaryUnavailable(_)
            | Error::PrimaryTimeout { .. }
            | Error::BatchRejected { .. } => ErrorCategory::Primary,

            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,

            Error::UnsupportedPlatform(_) => ErrorCategory::Platform,
        }
    }

    /// Returns whether this error is potentially recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::InvalidConfig { .. } => true,

            Error::Collection(_) => true,

            // The batch content will not change on retry
            Error::InvalidBatch { .. } => false,

            Error::StorageFault(_) => true,
            Error::CorruptRecord { .. } => false,
            // Retry once the other process exits
            Error::SpoolInUse { .. } => true,

            Error::PrimaryUnavailable(_) => true,
            Error::PrimaryTimeout { .. } => true,
            Error::BatchRejected { .. } => false,

            Error::Io(_) => true,
            Error::Json(_) => false,

            Error::UnsupportedPlatform(_) => false,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Run 'hostwatch config validate' and check the syntax of hostwatch.json."
            }
            Error::InvalidConfig { .. } => {
                "Fix the reported field in hostwatch.json, or remove it to use the default."
            }
            Error::Collection(_) => {
                "Check /proc and /sys are mounted and readable by the hostwatch user."
            }
            Error::InvalidBatch { .. } => {
                "The batch contains values the primary store cannot accept. It will be evicted after the rejection ceiling."
            }
            Error::StorageFault(_) => {
                "Free disk space under the spool directory or point spool.dir at a writable volume."
            }
            Error::CorruptRecord { .. } => {
                "The record was quarantined with a .corrupt suffix. Inspect or delete it manually."
            }
            Error::SpoolInUse { .. } => {
                "Stop the running 'hostwatch run' first, or point --config at a different spool.dir."
            }
            Error::PrimaryUnavailable(_) => {
                "Batches are queued locally and replayed once the primary store is reachable."
            }
            Error::PrimaryTimeout { .. } => {
                "Check primary store latency, or raise replay.store_timeout_ms."
            }
            Error::BatchRejected { .. } => {
                "Inspect the primary store's constraints; the batch stays queued until the rejection ceiling."
            }
            Error::Io(_) => {
                "Check disk space, permissions, and that the spool and primary directories exist."
            }
            Error::Json(_) => {
                "Invalid JSON. Check syntax with 'jq . <file>' or restore from backup."
            }
            Error::UnsupportedPlatform(_) => {
                "This feature is only available on Linux. Use --dry-run to exercise the pipeline."
            }
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidConfig { .. } => "Invalid Configuration",
            Error::Collection(_) => "Telemetry Collection Error",
            Error::InvalidBatch { .. } => "Malformed Telemetry Batch",
            Error::StorageFault(_) => "Local Queue Storage Fault",
            Error::CorruptRecord { .. } => "Corrupt Queue Record",
            Error::SpoolInUse { .. } => "Local Queue In Use",
            Error::PrimaryUnavailable(_) => "Primary Store Unavailable",
            Error::PrimaryTimeout { .. } => "Primary Store Timeout",
            Error::BatchRejected { .. } => "Batch Rejected",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
            Error::UnsupportedPlatform(_) => "Unsupported Platform",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Additional structured context (e.g., batch id, file path).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::InvalidConfig { field, .. } => {
                context.insert("field".to_string(), serde_json::json!(field));
            }
            Error::InvalidBatch { batch_id, .. } | Error::BatchRejected { batch_id, .. } => {
                context.insert("batch_id".to_string(), serde_json::json!(batch_id));
            }
            Error::CorruptRecord { path, .. } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            Error::PrimaryTimeout { millis } => {
                context.insert("timeout_ms".to_string(), serde_json::json!(millis));
            }
            Error::SpoolInUse { dir, pid } => {
                context.insert("dir".to_string(), serde_json::json!(dir));
                if let Some(pid) = pid {
                    context.insert("pid".to_string(), serde_json::json!(pid));
                }
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human-readable stderr output.
///
/// Output format:
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
///   Fix: [Remediation hint]
/// ```
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}",
        red = red,
        cyan = cyan,
        reset = reset,
        headline = err.headline(),
        message = err,
        remediation = err.remediation()
    )
}
