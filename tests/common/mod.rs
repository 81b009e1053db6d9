use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grid_engine::BackoffPolicy;
use grid_engine::Grid;
use grid_engine::GridBuilder;
use grid_engine::GridConfig;
use grid_engine::LocalNetwork;
use grid_engine::MainMemoryDb;
use grid_engine::MemMainMemoryDb;
use grid_engine::NodeId;
use grid_engine::ReplicationMode;
use tokio::time::timeout;

pub const WAIT_FOR_AVAILABLE_IN_SEC: u64 = 3;

/// Short protocol timeouts so failure paths finish within a test.
pub fn fast_config(
    node: NodeId,
    mode: ReplicationMode,
) -> GridConfig {
    let mut config = GridConfig::default();
    config.cluster.node_id = node;
    config.monitoring.prometheus_enabled = false;
    config.backup.mode = mode;
    config.backup.flush_interval_ms = 5;
    config.backup.ack_timeout_ms = 200;
    config.retry.protocol = BackoffPolicy {
        max_retries: 20,
        timeout_ms: 200,
        base_delay_ms: 1,
        max_delay_ms: 20,
    };
    config.retry.invalidation = BackoffPolicy {
        max_retries: 3,
        timeout_ms: 100,
        base_delay_ms: 1,
        max_delay_ms: 10,
    };
    config.retry.messenger = config.retry.protocol;
    config
}

/// A local cluster sharing one network and one backing store.
pub struct TestCluster {
    pub net: LocalNetwork,
    pub db: Arc<dyn MainMemoryDb>,
    pub mode: ReplicationMode,
}

impl TestCluster {
    pub fn new(mode: ReplicationMode) -> Self {
        crate::enable_logger();
        Self {
            net: LocalNetwork::new(),
            db: Arc::new(MemMainMemoryDb::new()),
            mode,
        }
    }

    /// Starts a member of node group `node`. The first member of a group is its master.
    pub fn start(
        &self,
        node: NodeId,
    ) -> Grid {
        GridBuilder::new(fast_config(node, self.mode))
            .network(self.net.clone())
            .storage(self.db.clone())
            .build()
            .expect("grid member starts")
    }

    /// Starts one master per node id and waits until all of them serve.
    pub async fn start_masters(
        &self,
        nodes: &[NodeId],
    ) -> Vec<Grid> {
        let grids: Vec<Grid> = nodes.iter().map(|n| self.start(*n)).collect();
        for grid in &grids {
            wait_available(grid).await;
        }
        grids
    }
}

pub async fn wait_available(grid: &Grid) {
    timeout(Duration::from_secs(WAIT_FOR_AVAILABLE_IN_SEC), grid.await_available())
        .await
        .expect("member available in time")
        .expect("service graph intact");
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}
