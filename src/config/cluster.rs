use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::NodeId;
use crate::Result;
use crate::SERVER;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Node group this member belongs to
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,

    /// Number of in-process node groups the binary starts
    #[serde(default = "default_local_nodes")]
    pub local_nodes: u16,

    /// Slaves started per node group by the binary
    #[serde(default)]
    pub slaves_per_node: u16,

    #[serde(default = "default_db_dir")]
    pub db_root_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            local_nodes: default_local_nodes(),
            slaves_per_node: 0,
            db_root_dir: default_db_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl ClusterConfig {
    /// Validates node identity and directories
    pub fn validate(&self) -> Result<()> {
        if self.node_id == SERVER {
            return Err(invalid("node_id cannot be 0 (reserved for unowned items)"));
        }

        if self.local_nodes == 0 {
            return Err(invalid("local_nodes must be at least 1"));
        }

        if self.db_root_dir.as_os_str().is_empty() {
            return Err(invalid("db_root_dir path cannot be empty"));
        }

        if self.log_dir.as_os_str().is_empty() {
            return Err(invalid("log_dir path cannot be empty"));
        }

        Ok(())
    }
}

fn default_node_id() -> NodeId {
    1
}
fn default_local_nodes() -> u16 {
    1
}
fn default_db_dir() -> PathBuf {
    PathBuf::from("./db")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
