//! Exit codes for the hostwatch CLI.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors

/// Exit codes for hostwatch commands.
///
/// These codes are a stable contract for supervisors and scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean run; nothing left in the local queue
    Clean = 0,

    /// Ran, but telemetry is still queued locally or health is degraded
    Degraded = 1,

    /// Invalid arguments or configuration
    ArgsError = 10,

    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Codes below 10 are outcomes, not errors.
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Name for JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Degraded => "OK_DEGRADED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }

    /// Exit code for a command that failed with `err`.
    pub fn for_error(err: &hw_common::Error) -> Self {
        use hw_common::ErrorCategory;
        match err.category() {
            ErrorCategory::Config => ExitCode::ArgsError,
            ErrorCategory::Io | ErrorCategory::Spool => ExitCode::IoError,
            _ => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::Degraded.as_i32(), 1);
        assert_eq!(ExitCode::ArgsError.as_i32(), 10);
        assert_eq!(ExitCode::InternalError.as_i32(), 20);
        assert_eq!(ExitCode::IoError.as_i32(), 21);
    }

    #[test]
    fn test_error_mapping() {
        let err = hw_common::Error::InvalidConfig {
            field: "spool.dir".to_string(),
            reason: "empty".to_string(),
        };
        assert_eq!(ExitCode::for_error(&err), ExitCode::ArgsError);

        let err = hw_common::Error::StorageFault("disk full".to_string());
        assert_eq!(ExitCode::for_error(&err), ExitCode::IoError);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitCode::Degraded.to_string(), "OK_DEGRADED (1)");
        assert!(ExitCode::Degraded.is_operational());
        assert!(ExitCode::IoError.is_error());
    }
}
