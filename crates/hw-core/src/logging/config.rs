//! Log settings resolved from `HOSTWATCH_LOG`, `HOSTWATCH_LOG_FORMAT` and
//! the `--log-level` / `--log-format` flags. Flags win over the environment,
//! and either wins over `RUST_LOG`.

use clap::ValueEnum;
use tracing_subscriber::filter::LevelFilter;

/// Where log lines go and how they look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    #[value(alias = "pretty")]
    Human,
    /// One JSON object per line, for journald or a log shipper.
    #[value(alias = "json")]
    Jsonl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[value(alias = "warning")]
    Warn,
    Error,
    /// Nothing at all, including data-loss events.
    Off,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    /// True when warn-level events would be filtered out.
    pub fn hides_warnings(self) -> bool {
        self > LogLevel::Warn
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Timestamps on human output. Off under systemd, which adds its own.
    pub timestamps: bool,
    /// Level came from a flag or `HOSTWATCH_LOG`, so `RUST_LOG` is ignored.
    pub explicit_level: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: LogLevel::Info,
            timestamps: std::env::var_os("JOURNAL_STREAM").is_none(),
            explicit_level: false,
        }
    }
}

impl LogConfig {
    /// Read the process environment, then apply flag overrides.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::resolve(
            std::env::var("HOSTWATCH_LOG").ok().as_deref(),
            std::env::var("HOSTWATCH_LOG_FORMAT").ok().as_deref(),
            cli_level,
            cli_format,
        )
    }

    /// Unparsable environment values are ignored rather than fatal; a typo in a
    /// unit file must not keep the daemon from starting.
    pub fn resolve(
        env_level: Option<&str>,
        env_format: Option<&str>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let defaults = LogConfig::default();
        let chosen_level = cli_level
            .or_else(|| env_level.and_then(|v| LogLevel::from_str(v.trim(), true).ok()));
        let format = cli_format
            .or_else(|| env_format.and_then(|v| LogFormat::from_str(v.trim(), true).ok()))
            .unwrap_or(defaults.format);

        LogConfig {
            format,
            level: chosen_level.unwrap_or(defaults.level),
            explicit_level: chosen_level.is_some(),
            ..defaults
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self.explicit_level = true;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }
}
