use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::constants::SERVICE_MESSENGER;
use crate::BackupManager;
use crate::CacheEngine;
use crate::Cluster;
use crate::GridConfig;
use crate::LocalNetwork;
use crate::MainMemoryDb;
use crate::MemberId;
use crate::Messenger;
use crate::NodeId;
use crate::Result;
use crate::ServiceGraph;
use crate::Store;

/// Running grid member: the context every subsystem of this process hangs off.
///
/// Built by [`GridBuilder`](crate::GridBuilder). Dropping a `Grid` without
/// calling [`shutdown`](Self::shutdown) leaves its background tasks running
/// until the shutdown token is cancelled.
pub struct Grid {
    pub(super) config: Arc<GridConfig>,
    pub(super) store: Store,
    pub(super) engine: Arc<CacheEngine>,
    pub(super) messenger: Arc<Messenger>,
    pub(super) backup: Arc<BackupManager>,
    pub(super) cluster: Arc<dyn Cluster>,
    pub(super) network: LocalNetwork,
    pub(super) db: Arc<dyn MainMemoryDb>,
    /// The store was opened by the builder rather than handed in
    pub(super) owns_db: bool,
    pub(super) services: Arc<ServiceGraph>,
    pub(super) shutdown: CancellationToken,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Grid {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("node_id", &self.node_id())
            .field("member_id", &self.member_id())
            .field("services", &self.services)
            .finish()
    }
}

impl Grid {
    pub fn node_id(&self) -> NodeId {
        self.cluster.node_id()
    }

    pub fn member_id(&self) -> MemberId {
        self.cluster.member_id()
    }

    pub fn is_master(&self) -> bool {
        self.cluster.is_master()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn backup(&self) -> &Arc<BackupManager> {
        &self.backup
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    pub fn services(&self) -> &ServiceGraph {
        &self.services
    }

    /// Resolves once this member serves requests for its node group.
    ///
    /// A slave resolves only after it has been promoted.
    pub async fn await_available(&self) -> Result<()> {
        self.services.await_available(SERVICE_MESSENGER).await
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Flushes pending backup records, leaves the cluster and stops the
    /// background tasks. A store opened from the configuration is closed as
    /// well.
    pub async fn shutdown(&self) -> Result<()> {
        if self.cluster.is_master() {
            if let Err(e) = self.backup.flush().await {
                warn!(?e, "final backup flush failed");
            }
        }
        if self.cluster.is_online() {
            self.network.kill(self.node_id(), self.member_id())?;
        }
        self.shutdown.cancel();
        self.messenger.close();
        self.services.reset_all();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(?e, "background task ended abnormally");
            }
        }
        if self.owns_db {
            self.db.close()?;
        }
        info!(node = self.node_id(), member = self.member_id(), "grid member stopped");
        Ok(())
    }
}
