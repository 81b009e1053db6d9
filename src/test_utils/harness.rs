use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::seq_base;
use crate::BackupManager;
use crate::CacheEngine;
use crate::Cluster;
use crate::GridConfig;
use crate::ItemId;
use crate::KeyedExecutor;
use crate::LocalNetwork;
use crate::MainMemoryDb;
use crate::MessageType;
use crate::NodeId;
use crate::OwnerDirectory;
use crate::PendingReplies;
use crate::Transport;

/// One engine on a [`LocalNetwork`] with a minimal inbox pump.
pub struct TestMember {
    pub engine: Arc<CacheEngine>,
    pub backup: Arc<BackupManager>,
    pub cluster: Arc<dyn Cluster>,
    pub transport: Arc<dyn Transport>,
    pub shutdown: CancellationToken,
    pump: JoinHandle<()>,
}

impl Drop for TestMember {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pump.abort();
    }
}

/// Joins `node` to `net` and serves its inbox: replies complete pending
/// requests, backup packets are applied, coherence requests run in per-line
/// order.
pub fn spawn_member(
    net: &LocalNetwork,
    node: NodeId,
    db: Arc<dyn MainMemoryDb>,
    config: &GridConfig,
) -> TestMember {
    let conn = net.join(node).expect("join");
    let pending = Arc::new(PendingReplies::with_seq_base(seq_base(conn.cluster.member_id())));
    let shutdown = CancellationToken::new();
    let backup = Arc::new(BackupManager::new(
        config.backup.clone(),
        conn.transport.clone(),
        conn.cluster.clone(),
        pending.clone(),
    ));
    let engine = CacheEngine::new(
        config,
        OwnerDirectory::new(db),
        conn.transport.clone(),
        conn.cluster.clone(),
        pending.clone(),
        backup.clone(),
        shutdown.clone(),
    );
    backup.set_image_source(engine.image_source());

    let mut inbox = conn.inbox;
    let transport = conn.transport.clone();
    let (e, b) = (engine.clone(), backup.clone());
    let pump = tokio::spawn(async move {
        let lines: KeyedExecutor<ItemId> = KeyedExecutor::new(4);
        while let Some(msg) = inbox.recv().await {
            match msg.kind {
                MessageType::Backup => {
                    if let Ok(ack) = b.handle_packet(&msg) {
                        let _ = transport.send(ack).await;
                    }
                }
                kind if kind.is_response() => {
                    e.count_received(kind);
                    pending.complete(msg);
                }
                _ => {
                    let e = e.clone();
                    lines.submit(msg.id.unwrap_or_default(), async move { e.handle_message(msg).await });
                }
            }
        }
    });

    TestMember {
        engine,
        backup,
        cluster: conn.cluster,
        transport: conn.transport,
        shutdown,
        pump,
    }
}
