//! Configuration resolution for hostwatch.
//!
//! Implements deterministic config resolution order:
//! 1. Explicit CLI flag (--config)
//! 2. Environment variable (HOSTWATCH_CONFIG)
//! 3. XDG default (~/.config/hostwatch/hostwatch.json)
//! 4. Built-in defaults

use std::env;
use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::{ConfigResolution, ConfigSource, HostwatchConfig};
use crate::error::{Error, Result};

/// File name looked up in the config directory.
pub const CONFIG_FILE_NAME: &str = "hostwatch.json";

/// Configuration file paths.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Explicit path to hostwatch.json
    pub config_path: Option<PathBuf>,
    /// Directory searched instead of the XDG config dir
    pub config_dir: Option<PathBuf>,
}

/// Configuration resolver with deterministic resolution order.
#[derive(Debug)]
pub struct ConfigResolver {
    cli_paths: ConfigPaths,
}

impl ConfigResolver {
    /// Create a new resolver with CLI paths.
    pub fn new(paths: ConfigPaths) -> Self {
        ConfigResolver { cli_paths: paths }
    }

    /// Create a resolver with no CLI overrides.
    pub fn with_defaults() -> Self {
        ConfigResolver {
            cli_paths: ConfigPaths::default(),
        }
    }

    /// Resolve the config directory path.
    pub fn resolve_config_dir(&self) -> Option<PathBuf> {
        if let Some(ref dir) = self.cli_paths.config_dir {
            return Some(dir.clone());
        }

        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("hostwatch"));
        }

        dirs::config_dir().map(|d| d.join("hostwatch"))
    }

    /// Resolve the hostwatch.json path.
    pub fn resolve_config_path(&self) -> (Option<PathBuf>, ConfigResolution) {
        // 1. CLI flag
        if let Some(ref path) = self.cli_paths.config_path {
            return (Some(path.clone()), ConfigResolution::CliFlag);
        }

        // 2. HOSTWATCH_CONFIG env var
        if let Ok(path) = env::var("HOSTWATCH_CONFIG") {
            return (Some(PathBuf::from(path)), ConfigResolution::EnvVar);
        }

        // 3. XDG config dir
        if let Some(config_dir) = self.resolve_config_dir() {
            let path = config_dir.join(CONFIG_FILE_NAME);
            if path.exists() {
                return (Some(path), ConfigResolution::XdgConfig);
            }
        }

        // 4. Default
        (None, ConfigResolution::Default)
    }

    /// Load configuration from the resolved path or defaults, then validate it.
    pub fn load(&self) -> Result<(HostwatchConfig, ConfigSource)> {
        let (path, resolution) = self.resolve_config_path();

        let (config, source) = match path {
            Some(p) => {
                let content = fs::read_to_string(&p).map_err(|e| {
                    Error::Config(format!("failed to read config from {}: {}", p.display(), e))
                })?;

                let hash = compute_sha256(&content);

                let config: HostwatchConfig = serde_json::from_str(&content).map_err(|e| {
                    Error::Config(format!("failed to parse {}: {}", p.display(), e))
                })?;

                (
                    config,
                    ConfigSource {
                        path: Some(p.to_string_lossy().to_string()),
                        hash: Some(hash),
                        resolution,
                    },
                )
            }
            None => (
                HostwatchConfig::default(),
                ConfigSource {
                    path: None,
                    hash: None,
                    resolution: ConfigResolution::Default,
                },
            ),
        };

        config.validate()?;
        Ok((config, source))
    }
}

/// Compute SHA-256 hash of a string.
fn compute_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolver_defaults_with_empty_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: None,
            config_dir: Some(dir.path().to_path_buf()),
        });

        // HOSTWATCH_CONFIG may be set in the environment running the tests
        if env::var("HOSTWATCH_CONFIG").is_err() {
            let (config, source) = resolver.load().unwrap();
            assert_eq!(source.resolution, ConfigResolution::Default);
            assert!(source.path.is_none());
            assert_eq!(config, HostwatchConfig::default());
        }
    }

    #[test]
    fn test_sha256_hash() {
        let hash = compute_sha256("test content");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_load_from_cli_path() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(br#"{"sampling": {"interval_secs": 10, "host_id": "edge-01"}}"#)
            .unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
            config_dir: None,
        });

        let (config, source) = resolver.load().unwrap();
        assert_eq!(source.resolution, ConfigResolution::CliFlag);
        assert!(source.hash.is_some());
        assert_eq!(config.sampling.interval_secs, 10);
        assert_eq!(config.sampling.host_id.as_deref(), Some("edge-01"));
    }

    #[test]
    fn test_load_from_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"replay": {"rejection_ceiling": 2}}"#,
        )
        .unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: None,
            config_dir: Some(dir.path().to_path_buf()),
        });

        if env::var("HOSTWATCH_CONFIG").is_err() {
            let (config, source) = resolver.load().unwrap();
            assert_eq!(source.resolution, ConfigResolution::XdgConfig);
            assert_eq!(config.replay.rejection_ceiling, 2);
        }
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"{ not json").unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
            config_dir: None,
        });

        let err = resolver.load().unwrap_err();
        assert_eq!(err.code(), 10);
    }

    #[test]
    fn test_semantically_invalid_file_rejected() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(br#"{"spool": {"max_batches": 0}}"#).unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
            config_dir: None,
        });

        let err = resolver.load().unwrap_err();
        assert_eq!(err.code(), 11);
    }
}
