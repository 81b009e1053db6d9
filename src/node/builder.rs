//! Assembly of a [`Grid`] member.
//!
//! [`GridBuilder`] registers the member's services in a [`ServiceGraph`],
//! constructs them in dependency order and spawns the background tasks:
//! the inbox [`Dispatcher`] and the backup flush loop.
//!
//! ## Example
//! ```ignore
//! let net = LocalNetwork::new();
//! let grid = GridBuilder::new(config)
//!     .network(net.clone())
//!     .storage(Arc::new(MemMainMemoryDb::new()))
//!     .build()?;
//! grid.await_available().await?;
//! let id = grid.store().put(Bytes::from_static(b"hello")).await?;
//! ```
//!
//! ## Notes
//! - Without [`storage`](GridBuilder::storage) the store named by
//!   `storage.backend` is opened.
//! - Without [`network`](GridBuilder::network) the member runs alone on a
//!   private [`LocalNetwork`].
//! - `build()` spawns tasks and must run inside a tokio runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::Dispatcher;
use crate::constants::SERVICE_BACKUP;
use crate::constants::SERVICE_CACHE;
use crate::constants::SERVICE_CLUSTER;
use crate::constants::SERVICE_DIRECTORY;
use crate::constants::SERVICE_MESSENGER;
use crate::constants::SERVICE_STORAGE;
use crate::open_main_memory_db;
use crate::seq_base;
use crate::utils::async_task::spawn_task;
use crate::BackupManager;
use crate::CacheEngine;
use crate::Connection;
use crate::Grid;
use crate::GridConfig;
use crate::GridError;
use crate::KeyedExecutor;
use crate::LocalNetwork;
use crate::MainMemoryDb;
use crate::Messenger;
use crate::OwnerDirectory;
use crate::PendingReplies;
use crate::Result;
use crate::ServiceGraph;
use crate::Store;

/// Fluent construction of one grid member.
pub struct GridBuilder {
    config: GridConfig,
    storage: Option<Arc<dyn MainMemoryDb>>,
    network: Option<LocalNetwork>,
    shutdown: CancellationToken,
}

/// Services constructed so far, filled in graph order.
#[derive(Default)]
struct Wiring {
    db: Option<Arc<dyn MainMemoryDb>>,
    directory: Option<OwnerDirectory>,
    connection: Option<Connection>,
    pending: Option<Arc<PendingReplies>>,
    backup: Option<Arc<BackupManager>>,
    engine: Option<Arc<CacheEngine>>,
    messenger: Option<Arc<Messenger>>,
}

fn missing(service: &str) -> GridError {
    GridError::ServiceGraph(format!("{service} constructed before its dependencies"))
}

impl GridBuilder {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            storage: None,
            network: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Backing store shared with the other members of the cluster.
    pub fn storage(
        mut self,
        db: Arc<dyn MainMemoryDb>,
    ) -> Self {
        self.storage = Some(db);
        self
    }

    pub fn network(
        mut self,
        network: LocalNetwork,
    ) -> Self {
        self.network = Some(network);
        self
    }

    /// Token whose cancellation stops the member's background tasks.
    pub fn shutdown_signal(
        mut self,
        shutdown: CancellationToken,
    ) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn service_graph() -> Result<ServiceGraph> {
        let mut graph = ServiceGraph::new();
        graph
            .add(SERVICE_STORAGE, &[])
            .add(SERVICE_DIRECTORY, &[SERVICE_STORAGE])
            .add(SERVICE_CLUSTER, &[])
            .add(SERVICE_BACKUP, &[SERVICE_CLUSTER])
            .add(SERVICE_CACHE, &[SERVICE_DIRECTORY, SERVICE_CLUSTER, SERVICE_BACKUP])
            .add(SERVICE_MESSENGER, &[SERVICE_CACHE]);
        graph.build()?;
        Ok(graph)
    }

    /// Joins the network and starts serving.
    ///
    /// Storage and directory are available at once. The cluster, cache and
    /// messenger become available when the member reports online as master,
    /// or after a slave's promotion.
    pub fn build(self) -> Result<Grid> {
        let Self {
            config,
            storage,
            network,
            shutdown,
        } = self;
        let owns_db = storage.is_none();
        let network = network.unwrap_or_default();
        let services = Arc::new(Self::service_graph()?);
        let mut storage = storage;
        let mut w = Wiring::default();

        for service in services.order().to_vec() {
            match service.as_str() {
                SERVICE_STORAGE => {
                    w.db = Some(match storage.take() {
                        Some(db) => db,
                        None => open_main_memory_db(&config)?,
                    });
                    services.set_available(SERVICE_STORAGE)?;
                }
                SERVICE_DIRECTORY => {
                    let db = w.db.clone().ok_or_else(|| missing(SERVICE_DIRECTORY))?;
                    w.directory = Some(OwnerDirectory::new(db));
                    services.set_available(SERVICE_DIRECTORY)?;
                }
                SERVICE_CLUSTER => {
                    let conn = network.join(config.cluster.node_id)?;
                    // seqs disjoint from earlier members of this node group
                    let base = seq_base(conn.cluster.member_id());
                    w.pending = Some(Arc::new(PendingReplies::with_seq_base(base)));
                    w.connection = Some(conn);
                    services.set_ready(SERVICE_CLUSTER)?;
                }
                SERVICE_BACKUP => {
                    let conn = w.connection.as_ref().ok_or_else(|| missing(SERVICE_BACKUP))?;
                    let pending = w.pending.clone().ok_or_else(|| missing(SERVICE_BACKUP))?;
                    w.backup = Some(Arc::new(BackupManager::new(
                        config.backup.clone(),
                        conn.transport.clone(),
                        conn.cluster.clone(),
                        pending,
                    )));
                    // a slave's backup service serves by applying packets
                    services.set_available(SERVICE_BACKUP)?;
                }
                SERVICE_CACHE => {
                    let conn = w.connection.as_ref().ok_or_else(|| missing(SERVICE_CACHE))?;
                    w.engine = Some(CacheEngine::new(
                        &config,
                        w.directory.clone().ok_or_else(|| missing(SERVICE_CACHE))?,
                        conn.transport.clone(),
                        conn.cluster.clone(),
                        w.pending.clone().ok_or_else(|| missing(SERVICE_CACHE))?,
                        w.backup.clone().ok_or_else(|| missing(SERVICE_CACHE))?,
                        shutdown.clone(),
                    ));
                    if let (Some(backup), Some(engine)) = (&w.backup, &w.engine) {
                        backup.set_image_source(engine.image_source());
                    }
                    services.set_ready(SERVICE_CACHE)?;
                }
                SERVICE_MESSENGER => {
                    let conn = w.connection.as_ref().ok_or_else(|| missing(SERVICE_MESSENGER))?;
                    w.messenger = Some(Arc::new(Messenger::new(
                        w.engine.clone().ok_or_else(|| missing(SERVICE_MESSENGER))?,
                        conn.transport.clone(),
                        w.pending.clone().ok_or_else(|| missing(SERVICE_MESSENGER))?,
                        config.retry.messenger,
                        config.cache.max_redirects,
                        config.cache.dispatch_workers,
                    )));
                    services.set_ready(SERVICE_MESSENGER)?;
                }
                other => return Err(GridError::ServiceGraph(format!("no constructor for {other}")).into()),
            }
            debug!(service = %service, "service constructed");
        }

        let (Some(db), Some(conn), Some(pending), Some(backup), Some(engine), Some(messenger)) =
            (w.db, w.connection, w.pending, w.backup, w.engine, w.messenger)
        else {
            return Err(GridError::ServiceGraph("service graph left a service unconstructed".into()).into());
        };
        let Connection {
            transport,
            cluster,
            inbox,
        } = conn;

        // first subscriber: sees the events raised while joining
        let events = cluster.subscribe();
        let dispatcher = Arc::new(Dispatcher {
            engine: engine.clone(),
            messenger: messenger.clone(),
            backup: backup.clone(),
            transport,
            cluster: cluster.clone(),
            pending,
            services: services.clone(),
            executor: KeyedExecutor::new(config.cache.dispatch_workers),
        });

        let mut tasks = Vec::new();
        let token = shutdown.clone();
        spawn_task("dispatcher", move || dispatcher.run(inbox, events, token), Some(&mut tasks));
        let flusher = backup.clone();
        let token = shutdown.clone();
        spawn_task("backup flush", move || flusher.run_flush_loop(token), Some(&mut tasks));

        info!(
            node = cluster.node_id(),
            member = cluster.member_id(),
            master = cluster.is_master(),
            order = ?services.order(),
            "grid member built"
        );

        Ok(Grid {
            config: Arc::new(config),
            store: Store::new(engine.clone()),
            engine,
            messenger,
            backup,
            cluster,
            network,
            db,
            owns_db,
            services,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}
