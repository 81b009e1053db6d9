//! Inbox loop of one grid member.
//!
//! Replies complete pending exchanges right away. Requests are queued on a
//! [`KeyedExecutor`]: coherence requests by item, messenger traffic by
//! sender, backup packets and promotion on a single key so a promotion
//! replays everything received before it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::constants::SERVICE_BACKUP;
use crate::constants::SERVICE_CACHE;
use crate::constants::SERVICE_CLUSTER;
use crate::constants::SERVICE_MESSENGER;
use crate::BackupManager;
use crate::CacheEngine;
use crate::Cluster;
use crate::ClusterEvent;
use crate::ItemId;
use crate::KeyedExecutor;
use crate::Message;
use crate::MessageType;
use crate::Messenger;
use crate::NodeId;
use crate::PendingReplies;
use crate::Result;
use crate::ServiceGraph;
use crate::ServiceState;
use crate::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DispatchKey {
    Line(ItemId),
    Peer(NodeId),
    Backup,
}

pub(crate) struct Dispatcher {
    pub(crate) engine: Arc<CacheEngine>,
    pub(crate) messenger: Arc<Messenger>,
    pub(crate) backup: Arc<BackupManager>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) pending: Arc<PendingReplies>,
    pub(crate) services: Arc<ServiceGraph>,
    pub(crate) executor: KeyedExecutor<DispatchKey>,
}

impl Dispatcher {
    /// Serves `inbox` and membership `events` until `shutdown` is cancelled.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        mut events: broadcast::Receiver<ClusterEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("dispatcher stopped");
                    self.executor.close();
                    return Ok(());
                }
                msg = inbox.recv() => match msg {
                    Some(msg) => self.dispatch(msg),
                    None => {
                        info!("inbox closed, dispatcher stopped");
                        self.executor.close();
                        return Ok(());
                    }
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.on_cluster_event(event),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "cluster events lagged"),
                    Err(RecvError::Closed) => events_open = false,
                },
            }
        }
    }

    /// Whether this member answers requests for its node group.
    fn serving(&self) -> bool {
        self.cluster.is_master() && matches!(self.services.state(SERVICE_CACHE), Ok(ServiceState::Available))
    }

    fn dispatch(
        self: &Arc<Self>,
        msg: Message,
    ) {
        trace!(%msg, "dispatch");
        match msg.kind {
            MessageType::Backup => {
                let this = self.clone();
                self.executor.submit(DispatchKey::Backup, async move {
                    match this.backup.handle_packet(&msg) {
                        Ok(ack) => this.reply(ack).await,
                        Err(e) => error!(%msg, ?e, "malformed backup packet dropped"),
                    }
                });
            }
            kind if kind.is_response() => {
                self.engine.count_received(kind);
                if !self.pending.complete(msg) {
                    debug!(%kind, "reply without a waiting request");
                }
            }
            MessageType::Msg => {
                let this = self.clone();
                let serving = self.serving();
                self.executor.submit(DispatchKey::Peer(msg.from), async move {
                    let reply = if serving {
                        this.messenger.handle_message(&msg)
                    } else {
                        msg.reply(MessageType::Nack)
                    };
                    this.reply(reply).await;
                });
            }
            kind => {
                let key = match msg.id {
                    Some(id) => DispatchKey::Line(id),
                    None => DispatchKey::Peer(msg.from),
                };
                let this = self.clone();
                // a slave holds no shared copies, so invalidations are answered anyway
                let serving = kind == MessageType::Inv || self.serving();
                self.executor.submit(key, async move {
                    if serving {
                        this.engine.handle_message(msg).await;
                    } else {
                        debug!(%msg, "not serving yet");
                        this.reply(msg.reply(MessageType::Nack)).await;
                    }
                });
            }
        }
    }

    async fn reply(
        &self,
        msg: Message,
    ) {
        if let Err(e) = self.transport.send(msg).await {
            debug!(?e, "reply not sent");
        }
    }

    fn on_cluster_event(
        self: &Arc<Self>,
        event: ClusterEvent,
    ) {
        debug!(?event, "cluster event");
        match event {
            ClusterEvent::Online { master } => {
                self.set_state(SERVICE_CLUSTER, ServiceState::Available);
                if master {
                    self.set_state(SERVICE_CACHE, ServiceState::Available);
                    self.set_state(SERVICE_MESSENGER, ServiceState::Available);
                }
            }
            ClusterEvent::Offline => {
                warn!(node = self.cluster.node_id(), "member went offline");
                self.set_state(SERVICE_CLUSTER, ServiceState::Ready);
            }
            ClusterEvent::SwitchToMaster => {
                let this = self.clone();
                self.executor.submit(DispatchKey::Backup, async move { this.promote() });
            }
            ClusterEvent::SlaveAdded(member) => {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.backup.full_sync(member).await {
                        warn!(member, ?e, "full sync of new slave failed");
                    }
                });
            }
            ClusterEvent::NodeRemoved(node) => {
                if let Err(e) = self.engine.on_node_removed(node) {
                    error!(node, ?e, "releasing a removed node failed");
                }
            }
            ClusterEvent::NodeSwitched(node) => self.engine.on_node_switched(node),
            ClusterEvent::NodeAdded(node) => {
                info!(node, "node group joined");
            }
            ClusterEvent::SlaveRemoved(_) | ClusterEvent::JoinedCluster => {}
        }
    }

    /// Turns the replayed shadow table into owned lines and starts serving.
    fn promote(&self) {
        let images = self.backup.take_shadow();
        let installed = self.engine.install_owned(images);
        info!(
            node = self.cluster.node_id(),
            member = self.cluster.member_id(),
            installed,
            applied = self.backup.applied_seq(),
            "promoted to master"
        );
        self.set_state(SERVICE_BACKUP, ServiceState::Available);
        self.set_state(SERVICE_CACHE, ServiceState::Available);
        self.set_state(SERVICE_MESSENGER, ServiceState::Available);
    }

    fn set_state(
        &self,
        service: &str,
        state: ServiceState,
    ) {
        if let Err(e) = self.services.set_state(service, state) {
            error!(service, ?e, "service state not updated");
        }
    }
}
