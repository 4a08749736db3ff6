//! Configuration types for the StripeStore OSD
//!
//! The daemon reads a TOML file with `[storage]`, `[stage]`, `[gmax]` and
//! `[logging]` sections. Every field has a default so a partial (or absent)
//! file is valid.

use crate::checksum::ChecksumAlgorithm;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration of an OSD
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OsdConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stage: StageConfig,
    #[serde(default)]
    pub gmax: GmaxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OsdConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the storage engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_subdirs_per_level < 2 {
            return Err(Error::Configuration(
                "max_subdirs_per_level must be at least 2".into(),
            ));
        }
        if self.stage.threads == 0 {
            return Err(Error::Configuration("stage.threads must be positive".into()));
        }
        if self.stage.queue_depth == 0 {
            return Err(Error::Configuration(
                "stage.queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Local object storage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the hashed storage layout
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Compute and store per-object checksums
    #[serde(default)]
    pub checksums_enabled: bool,
    /// Digest used when checksums are enabled
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Maximum number of hash subdirectories per directory level
    #[serde(default = "default_max_subdirs")]
    pub max_subdirs_per_level: u32,
    /// Number of hash directory levels above each file directory
    #[serde(default = "default_max_depth")]
    pub max_dir_depth: u32,
    /// fsync object files after every write
    #[serde(default)]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            checksums_enabled: false,
            checksum_algorithm: ChecksumAlgorithm::default(),
            max_subdirs_per_level: default_max_subdirs(),
            max_dir_depth: default_max_depth(),
            sync_writes: false,
        }
    }
}

/// Storage thread pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of storage threads
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Bounded inbound queue length per storage thread
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// GMAX hint transport settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GmaxConfig {
    /// Send and receive GMAX datagrams
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UDP address to receive GMAX datagrams on
    #[serde(default = "default_gmax_listen")]
    pub listen: SocketAddr,
}

impl Default for GmaxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_gmax_listen(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format of log lines
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/stripestore/objs")
}

const fn default_max_subdirs() -> u32 {
    256
}

const fn default_max_depth() -> u32 {
    4
}

const fn default_threads() -> usize {
    4
}

const fn default_queue_depth() -> usize {
    1024
}

const fn default_true() -> bool {
    true
}

fn default_gmax_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 32640))
}

fn default_log_level() -> String {
    "info".to_string()
}
