//! Configuration management module for the object grid.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Component-wise validation
mod backup;
mod cache;
mod cluster;
mod monitoring;
mod retry;
mod storage;
pub use backup::*;
pub use cache::*;
pub use cluster::*;
pub use monitoring::*;
pub use retry::*;
pub use storage::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Main configuration container for one grid member
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables with the `GRID__` prefix (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct GridConfig {
    /// Node identity and local directories
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Line table and coherence protocol parameters
    #[serde(default)]
    pub cache: CacheConfig,
    /// Master to slave replication
    #[serde(default)]
    pub backup: BackupConfig,
    /// Backing store selection
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retry policies for protocol exchanges
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Metrics exposition
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Debug for GridConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("GridConfig")
            .field("cluster", &self.cluster)
            .field("storage", &self.storage.backend)
            .finish()
    }
}

impl GridConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `GRID__` prefix (highest priority)
    ///
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("GRID__CLUSTER__NODE_ID", "3");
    /// let cfg = GridConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("GRID")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("GRID")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        self.cluster.validate()?;
        self.cache.validate()?;
        self.backup.validate()?;
        self.storage.validate()?;
        self.retry.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}

pub(crate) fn invalid(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError::Message(msg.into()))
}
