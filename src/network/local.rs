use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::Connection;
use super::Transport;
use crate::codec;
use crate::constants::TREE_NODES_ROOT;
use crate::constants::TREE_PROPERTIES_ROOT;
use crate::Cluster;
use crate::ClusterEvent;
use crate::DistributedTree;
use crate::MemTree;
use crate::MemberId;
use crate::Message;
use crate::NetworkError;
use crate::NodeId;
use crate::Result;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the hub does with a message about to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Deliver,
    Drop,
    /// Deliver the message twice in a row
    Duplicate,
}

/// Test hook deciding the fate of every message sent through the hub.
pub type Interceptor = Arc<dyn Fn(&Message) -> Delivery + Send + Sync>;

/// Live members per node group in join order. The first one is the master.
#[derive(Debug, Clone, Default)]
struct ClusterView {
    groups: BTreeMap<NodeId, Vec<MemberId>>,
}

impl ClusterView {
    fn master(
        &self,
        node: NodeId,
    ) -> Option<MemberId> {
        self.groups.get(&node).and_then(|m| m.first().copied())
    }
}

struct Endpoint {
    inbox: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<ClusterEvent>,
    online: Arc<AtomicBool>,
}

struct Hub {
    tree: Arc<MemTree>,
    view: ArcSwap<ClusterView>,
    endpoints: RwLock<HashMap<(NodeId, MemberId), Endpoint>>,
    next_member: Mutex<HashMap<NodeId, MemberId>>,
    // join and kill are serialized so events follow view changes in order
    membership: Mutex<()>,
    wire_codec: bool,
    interceptor: RwLock<Option<Interceptor>>,
}

fn member_path(
    node: NodeId,
    member: MemberId,
) -> String {
    format!("{TREE_NODES_ROOT}/{node}/{member}")
}

fn session(
    node: NodeId,
    member: MemberId,
) -> String {
    format!("{node}:{member}")
}

impl Hub {
    /// Rebuilds the view from the member nodes of the tree.
    fn refresh_view(&self) -> Result<()> {
        let mut view = ClusterView::default();
        for node in self.tree.children(TREE_NODES_ROOT)? {
            let Ok(node_id) = node.parse::<NodeId>() else {
                continue;
            };
            let members: Vec<MemberId> = self
                .tree
                .children(&format!("{TREE_NODES_ROOT}/{node}"))?
                .iter()
                .filter_map(|m| m.parse().ok())
                .collect();
            if !members.is_empty() {
                view.groups.insert(node_id, members);
            }
        }
        self.view.store(Arc::new(view));
        Ok(())
    }

    fn emit(
        &self,
        node: NodeId,
        member: MemberId,
        event: ClusterEvent,
    ) {
        if let Some(ep) = self.endpoints.read().get(&(node, member)) {
            trace!(node, member, ?event, "cluster event");
            let _ = ep.events.send(event);
        }
    }

    fn broadcast_except(
        &self,
        except: Option<(NodeId, MemberId)>,
        event: ClusterEvent,
    ) {
        for (key, ep) in self.endpoints.read().iter() {
            if Some(*key) != except {
                let _ = ep.events.send(event.clone());
            }
        }
    }

    fn deliver(
        &self,
        node: NodeId,
        member: MemberId,
        msg: Message,
    ) -> Result<()> {
        let verdict = match self.interceptor.read().as_ref() {
            Some(f) => f(&msg),
            None => Delivery::Deliver,
        };
        if verdict == Delivery::Drop {
            debug!(%msg, "message dropped by interceptor");
            return Ok(());
        }

        let msg = if self.wire_codec {
            codec::decode(codec::encode(&msg)?)?
        } else {
            let mut msg = msg;
            msg.set_incoming();
            msg
        };

        let endpoints = self.endpoints.read();
        let ep = endpoints
            .get(&(node, member))
            .ok_or(NetworkError::MemberNotFound {
                node_id: node,
                member_id: member,
            })?;
        if verdict == Delivery::Duplicate {
            let _ = ep.inbox.send(msg.clone());
        }
        ep.inbox
            .send(msg)
            .map_err(|_| NetworkError::MemberNotFound {
                node_id: node,
                member_id: member,
            })?;
        Ok(())
    }

    fn is_connected(
        &self,
        node: NodeId,
        member: MemberId,
    ) -> bool {
        self.endpoints.read().contains_key(&(node, member))
    }
}

/// In-process cluster: every joined member gets a [`Connection`] whose
/// transport and cluster view are backed by one shared hub.
///
/// Master election is "oldest live member of the group", read from the
/// member nodes of a [`MemTree`].
#[derive(Clone)]
pub struct LocalNetwork {
    hub: Arc<Hub>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Every message is encoded and decoded through the wire codec on delivery.
    pub fn with_wire_codec() -> Self {
        Self::build(true)
    }

    fn build(wire_codec: bool) -> Self {
        Self {
            hub: Arc::new(Hub {
                tree: Arc::new(MemTree::new()),
                view: ArcSwap::from_pointee(ClusterView::default()),
                endpoints: RwLock::new(HashMap::new()),
                next_member: Mutex::new(HashMap::new()),
                membership: Mutex::new(()),
                wire_codec,
                interceptor: RwLock::new(None),
            }),
        }
    }

    pub fn tree(&self) -> Arc<MemTree> {
        self.hub.tree.clone()
    }

    pub fn set_interceptor(
        &self,
        interceptor: Option<Interceptor>,
    ) {
        *self.hub.interceptor.write() = interceptor;
    }

    pub fn master_of(
        &self,
        node: NodeId,
    ) -> Option<MemberId> {
        self.hub.view.load().master(node)
    }

    /// Adds a member to node group `node`. The first member is its master.
    pub fn join(
        &self,
        node: NodeId,
    ) -> Result<Connection> {
        let hub = &self.hub;
        let _guard = hub.membership.lock();

        let member = {
            let mut next = hub.next_member.lock();
            let counter = next.entry(node).or_insert(0);
            *counter += 1;
            *counter
        };
        hub.tree
            .create(&member_path(node, member), Bytes::new(), Some(session(node, member)))?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let online = Arc::new(AtomicBool::new(true));
        hub.endpoints.write().insert(
            (node, member),
            Endpoint {
                inbox: inbox_tx,
                events: events_tx.clone(),
                online: online.clone(),
            },
        );
        hub.refresh_view()?;

        let master = hub.view.load().master(node) == Some(member);
        info!(node, member, master, "member joined");
        let _ = events_tx.send(ClusterEvent::JoinedCluster);
        let _ = events_tx.send(ClusterEvent::Online { master });
        if master {
            hub.broadcast_except(Some((node, member)), ClusterEvent::NodeAdded(node));
        } else if let Some(m) = hub.view.load().master(node) {
            hub.emit(node, m, ClusterEvent::SlaveAdded(member));
        }

        Ok(Connection {
            transport: Arc::new(LocalTransport {
                hub: hub.clone(),
                node,
                member,
            }),
            cluster: Arc::new(LocalCluster {
                hub: hub.clone(),
                node,
                member,
                online,
                events: events_tx,
                first_subscriber: Mutex::new(Some(events_rx)),
            }),
            inbox: inbox_rx,
        })
    }

    /// Disconnects a member as if its process died.
    ///
    /// A surviving slave of a killed master is switched to master; a group
    /// without survivors is reported removed.
    pub fn kill(
        &self,
        node: NodeId,
        member: MemberId,
    ) -> Result<()> {
        let hub = &self.hub;
        let _guard = hub.membership.lock();

        let was_master = hub.view.load().master(node) == Some(member);
        let endpoint = hub.endpoints.write().remove(&(node, member)).ok_or(
            NetworkError::MemberNotFound {
                node_id: node,
                member_id: member,
            },
        )?;
        endpoint.online.store(false, Ordering::Release);
        let _ = endpoint.events.send(ClusterEvent::Offline);
        drop(endpoint);

        hub.tree.disconnect(&session(node, member))?;
        hub.refresh_view()?;
        let successor = hub.view.load().master(node);
        warn!(node, member, was_master, ?successor, "member left");

        match (was_master, successor) {
            (true, Some(next)) => {
                hub.emit(node, next, ClusterEvent::SwitchToMaster);
                hub.broadcast_except(Some((node, next)), ClusterEvent::NodeSwitched(node));
            }
            (true, None) => hub.broadcast_except(None, ClusterEvent::NodeRemoved(node)),
            (false, Some(master)) => hub.emit(node, master, ClusterEvent::SlaveRemoved(member)),
            (false, None) => {}
        }
        Ok(())
    }
}

struct LocalTransport {
    hub: Arc<Hub>,
    node: NodeId,
    member: MemberId,
}

#[async_trait]
impl Transport for LocalTransport {
    fn node_id(&self) -> NodeId {
        self.node
    }

    async fn send(
        &self,
        msg: Message,
    ) -> Result<()> {
        if !self.hub.is_connected(self.node, self.member) {
            return Err(NetworkError::Disconnected(self.node).into());
        }
        let master = self
            .hub
            .view
            .load()
            .master(msg.to)
            .ok_or(NetworkError::NodeUnreachable { node_id: msg.to })?;
        trace!(%msg, master, "send");
        self.hub.deliver(msg.to, master, msg)
    }

    async fn send_to_member(
        &self,
        member: MemberId,
        msg: Message,
    ) -> Result<()> {
        if !self.hub.is_connected(self.node, self.member) {
            return Err(NetworkError::Disconnected(self.node).into());
        }
        trace!(%msg, member, "send to member");
        self.hub.deliver(msg.to, member, msg)
    }
}

struct LocalCluster {
    hub: Arc<Hub>,
    node: NodeId,
    member: MemberId,
    online: Arc<AtomicBool>,
    events: broadcast::Sender<ClusterEvent>,
    first_subscriber: Mutex<Option<broadcast::Receiver<ClusterEvent>>>,
}

impl Cluster for LocalCluster {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn member_id(&self) -> MemberId {
        self.member
    }

    fn is_master(&self) -> bool {
        self.is_online() && self.hub.view.load().master(self.node) == Some(self.member)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.hub.view.load().groups.keys().copied().collect()
    }

    fn slaves(&self) -> Vec<MemberId> {
        self.hub
            .view
            .load()
            .groups
            .get(&self.node)
            .map(|members| members.iter().skip(1).copied().collect())
            .unwrap_or_default()
    }

    fn node_property(
        &self,
        node: NodeId,
        key: &str,
    ) -> Option<String> {
        let path = format!("{TREE_PROPERTIES_ROOT}/{node}/{key}");
        match self.hub.tree.get(&path) {
            Ok(Some(v)) => String::from_utf8(v.to_vec()).ok(),
            _ => None,
        }
    }

    fn set_node_property(
        &self,
        key: &str,
        value: &str,
    ) {
        let path = format!("{TREE_PROPERTIES_ROOT}/{}/{key}", self.node);
        if let Err(e) = self.hub.tree.set(&path, Bytes::copy_from_slice(value.as_bytes())) {
            warn!(?e, "failed to set node property {key}");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        match self.first_subscriber.lock().take() {
            Some(rx) => rx,
            None => self.events.subscribe(),
        }
    }
}
