use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory of the sled database, relative paths resolve against the working dir
    #[serde(default = "default_sled_path")]
    pub sled_path: PathBuf,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sled_path: default_sled_path(),
            cache_capacity: default_cache_capacity(),
            flush_every_ms: default_flush_every_ms(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == StorageBackend::Sled && self.sled_path.as_os_str().is_empty() {
            return Err(invalid("storage.sled_path cannot be empty with the sled backend"));
        }
        Ok(())
    }
}

fn default_sled_path() -> PathBuf {
    PathBuf::from("./db/main_memory")
}
fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024 //64MB
}
fn default_flush_every_ms() -> u64 {
    10
}
