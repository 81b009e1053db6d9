use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::CacheEngine;
use crate::CacheListener;
use crate::GridError;
use crate::ItemId;
use crate::KeyedExecutor;
use crate::LinkedMap;
use crate::ListenerEvent;
use crate::Message;
use crate::MessageRoute;
use crate::MessageType;
use crate::NetworkError;
use crate::NodeId;
use crate::PendingReplies;
use crate::Result;
use crate::Topic;
use crate::Transport;
use crate::SERVER;

/// Delivered `(sender, seq)` pairs remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 4096;

/// Ordered point-to-point messaging between grid nodes.
///
/// Sends to one destination are queued and each waits for its MSGACK before
/// the next one leaves, so a receiver sees one sender's messages in send
/// order. Retransmissions reuse the sequence number and are delivered once.
pub struct Messenger {
    me: NodeId,
    engine: Arc<CacheEngine>,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
    policy: BackoffPolicy,
    max_redirects: u32,
    queues: KeyedExecutor<NodeId>,
    subscribers: DashMap<Topic, Vec<Arc<dyn CacheListener>>>,
    seen: Mutex<LinkedMap<(NodeId, u64), ()>>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("me", &self.me)
            .field("topics", &self.subscribers.len())
            .finish()
    }
}

impl Messenger {
    pub fn new(
        engine: Arc<CacheEngine>,
        transport: Arc<dyn Transport>,
        pending: Arc<PendingReplies>,
        policy: BackoffPolicy,
        max_redirects: u32,
        workers: usize,
    ) -> Self {
        Self {
            me: engine.node_id(),
            engine,
            transport,
            pending,
            policy,
            max_redirects,
            queues: KeyedExecutor::new(workers),
            subscribers: DashMap::new(),
            seen: Mutex::new(LinkedMap::new()),
        }
    }

    /// Registers `listener` for messages on `topic`.
    pub fn subscribe(
        &self,
        topic: Topic,
        listener: Arc<dyn CacheListener>,
    ) {
        self.subscribers.entry(topic).or_default().push(listener);
    }

    /// Drops every subscriber of `topic`.
    pub fn unsubscribe_all(
        &self,
        topic: Topic,
    ) {
        self.subscribers.remove(&topic);
    }

    /// Sends `data` on `topic` to the master of `node` and waits for delivery.
    pub async fn send_to_node(
        &self,
        node: NodeId,
        topic: Topic,
        data: Bytes,
    ) -> Result<()> {
        let msg = Message::new(MessageType::Msg, self.me, node)
            .with_version(topic as u64)
            .with_data(data);
        let reply = self.send_queued(msg).await?;
        match reply.kind {
            MessageType::MsgAck => Ok(()),
            other => {
                warn!(node, %other, "unexpected answer to node message");
                Err(NetworkError::SignalSendFailed(format!("node {node} answered {other}")).into())
            }
        }
    }

    /// Sends `data` on `topic` to whichever node owns `id`, following
    /// ownership changes until it is delivered.
    pub async fn send_to_owner_of(
        &self,
        id: ItemId,
        topic: Topic,
        data: Bytes,
    ) -> Result<()> {
        let mut redirects = 0;
        let mut hint: Option<NodeId> = None;
        loop {
            let target = match hint.take() {
                Some(node) => node,
                None => match self.engine.route_message(id)? {
                    MessageRoute::Local(listener) => {
                        trace!(id, topic, "message for a local owner");
                        self.deliver(listener, Some(id), self.me, topic, &data);
                        return Ok(());
                    }
                    MessageRoute::Redirect(node) => node,
                    MessageRoute::NotFound => return Err(GridError::RefNotFound(id).into()),
                },
            };

            let msg = Message::new(MessageType::Msg, self.me, target)
                .with_id(id)
                .with_version(topic as u64)
                .with_data(data.clone());
            let reply = self.send_queued(msg).await?;
            match reply.kind {
                MessageType::MsgAck => return Ok(()),
                MessageType::NotFound => return Err(GridError::RefNotFound(id).into()),
                MessageType::ChngdOwnr => {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        return Err(GridError::Timeout {
                            id,
                            retries: self.max_redirects,
                        }
                        .into());
                    }
                    hint = reply
                        .nodes
                        .first()
                        .copied()
                        .filter(|n| *n != SERVER && *n != target && *n != self.me);
                    debug!(id, target, ?hint, "message owner moved");
                }
                other => {
                    warn!(id, %other, "unexpected answer to owner message");
                    return Err(GridError::Failed {
                        id,
                        reason: format!("owner answered {other}"),
                    }
                    .into());
                }
            }
        }
    }

    /// Queues `msg` behind earlier sends to the same node and returns its answer.
    async fn send_queued(
        &self,
        msg: Message,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let to = msg.to;
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let policy = self.policy;
        let msg = msg.with_seq(self.pending.next_seq());

        self.queues.submit(to, async move {
            let result = task_with_timeout_and_exponential_backoff(
                || exchange(transport.clone(), pending.clone(), msg.clone(), policy.timeout()),
                BackoffPolicy {
                    timeout_ms: policy.timeout_ms * 2,
                    ..policy
                },
            )
            .await;
            // the sender may have given up waiting
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| NetworkError::SignalSendFailed(format!("message queue to node {to} closed")))?
    }

    /// Receiver side: delivers an incoming MSG once and returns its answer.
    pub fn handle_message(
        &self,
        msg: &Message,
    ) -> Message {
        let key = (msg.from, msg.seq);
        if self.seen.lock().contains_key(&key) {
            debug!(from = msg.from, seq = msg.seq, "duplicate message acknowledged");
            return msg.reply(MessageType::MsgAck);
        }
        let data = msg.data.clone().unwrap_or_default();

        let listener = match msg.id {
            None => None,
            Some(id) => match self.engine.route_message(id) {
                Ok(MessageRoute::Local(listener)) => listener,
                Ok(MessageRoute::Redirect(node)) => {
                    let node = if node == msg.from { SERVER } else { node };
                    return msg.reply(MessageType::ChngdOwnr).with_nodes(vec![node]);
                }
                Ok(MessageRoute::NotFound) => return msg.reply(MessageType::NotFound),
                Err(e) => {
                    warn!(id, %e, "message routing failed");
                    return msg.reply(MessageType::ChngdOwnr).with_nodes(vec![SERVER]);
                }
            },
        };

        self.deliver(listener, msg.id, msg.from, msg.topic(), &data);
        let mut seen = self.seen.lock();
        seen.insert(key, ());
        while seen.len() > SEEN_CAPACITY {
            seen.pop_front();
        }
        msg.reply(MessageType::MsgAck)
    }

    fn deliver(
        &self,
        line_listener: Option<Arc<dyn CacheListener>>,
        id: Option<ItemId>,
        from: NodeId,
        topic: Topic,
        data: &Bytes,
    ) {
        let event = ListenerEvent::MessageReceived {
            id,
            from,
            topic,
            data: data.clone(),
        };
        if let Some(listener) = line_listener {
            event.dispatch(listener.as_ref());
        }
        let subscribers = self.subscribers.get(&topic).map(|s| s.value().clone()).unwrap_or_default();
        if subscribers.is_empty() && id.is_none() {
            trace!(topic, from, "message without subscribers dropped");
        }
        for s in subscribers {
            event.dispatch(s.as_ref());
        }
    }

    pub fn close(&self) {
        self.queues.close();
    }
}

/// One send of `msg` and the wait for its answer.
async fn exchange(
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
    msg: Message,
    wait: Duration,
) -> Result<Message> {
    let rx = pending.register(&msg);
    if let Err(e) = transport.send(msg.clone()).await {
        pending.remove(&msg);
        return Err(e);
    }
    let reply = pending
        .wait(&msg, rx, wait)
        .await
        .ok_or(NetworkError::AttemptTimeout(wait.as_millis() as u64))?;
    // a member that is still taking over its node group answers NACK
    if reply.kind == MessageType::Nack {
        return Err(NetworkError::SignalSendFailed(format!("node {} not serving yet", msg.to)).into());
    }
    Ok(reply)
}
