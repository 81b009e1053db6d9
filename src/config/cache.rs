use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Line table and coherence engine parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    /// Lines kept before least recently used ones are evicted
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Ids reserved per allocation round trip when `put` runs out
    #[serde(default = "default_id_allocation_batch")]
    pub id_allocation_batch: u64,

    /// CHNGD_OWNR redirects followed before a retry is charged
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Concurrent keys served by the incoming message executor
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            id_allocation_batch: default_id_allocation_batch(),
            max_redirects: default_max_redirects(),
            dispatch_workers: default_dispatch_workers(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_lines == 0 {
            return Err(invalid("cache.max_lines must be greater than 0"));
        }
        if self.id_allocation_batch == 0 {
            return Err(invalid("cache.id_allocation_batch must be greater than 0"));
        }
        if self.dispatch_workers == 0 {
            return Err(invalid("cache.dispatch_workers must be greater than 0"));
        }
        Ok(())
    }
}

fn default_max_lines() -> usize {
    100_000
}
fn default_id_allocation_batch() -> u64 {
    1024
}
fn default_max_redirects() -> u32 {
    16
}
fn default_dispatch_workers() -> usize {
    64
}
