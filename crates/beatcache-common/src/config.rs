//! Configuration types for beatcache
//!
//! The configuration file is TOML. Every section and field is optional;
//! anything left out falls back to its default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bytes in one gigabyte, as used by `max_disk_gb`
pub const GIGABYTE: u64 = 1024 * 1024 * 1024;

/// Root configuration for beatcache
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cache registry configuration
    #[serde(default)]
    pub house: HouseConfig,
    /// Archive storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&raw).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.house.max_disk_gb.is_finite() || self.house.max_disk_gb < 0.0 {
            return Err(Error::configuration(format!(
                "house.max_disk_gb must be a non-negative number, got {}",
                self.house.max_disk_gb
            )));
        }
        Ok(())
    }
}

/// Cache registry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HouseConfig {
    /// Disk budget for cached archives, in gigabytes
    #[serde(default = "default_max_disk_gb")]
    pub max_disk_gb: f64,
    /// Path of the persisted registry state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl HouseConfig {
    /// Disk budget in bytes
    #[must_use]
    pub fn max_size_bytes(&self) -> u64 {
        (GIGABYTE as f64 * self.max_disk_gb) as u64
    }
}

impl Default for HouseConfig {
    fn default() -> Self {
        Self {
            max_disk_gb: default_max_disk_gb(),
            state_file: default_state_file(),
        }
    }
}

/// Archive storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the cached archives
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_disk_gb() -> f64 {
    10.0
}

fn default_state_file() -> PathBuf {
    PathBuf::from("house.db")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}
