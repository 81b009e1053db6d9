use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// When a write on the master counts as committed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Writes return before slaves have them; the loss window is one flush interval.
    #[default]
    Async,
    /// Writes return once `replication_factor` slaves acknowledged the packet.
    Sync,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default)]
    pub mode: ReplicationMode,

    /// Interval of the background flush in async mode (milliseconds)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Slaves that must acknowledge a packet in sync mode (capped at the live slave count)
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Wait for one slave acknowledgment (milliseconds)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::default(),
            flush_interval_ms: default_flush_interval_ms(),
            replication_factor: default_replication_factor(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(invalid("backup.flush_interval_ms must be at least 1ms"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(invalid("backup.ack_timeout_ms must be at least 1ms"));
        }
        if self.mode == ReplicationMode::Sync && self.replication_factor == 0 {
            return Err(invalid(
                "backup.replication_factor must be greater than 0 in sync mode",
            ));
        }
        Ok(())
    }
}

fn default_flush_interval_ms() -> u64 {
    20
}
fn default_replication_factor() -> usize {
    1
}
fn default_ack_timeout_ms() -> u64 {
    500
}
