use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use crate::ItemId;
use crate::NodeId;
use crate::Topic;

/// Observer of per-line events.
///
/// Callbacks run on engine tasks after the line lock is released; they
/// should return quickly.
#[cfg_attr(test, automock)]
pub trait CacheListener: Send + Sync + 'static {
    /// The local copy of `id` was dropped
    fn invalidated(
        &self,
        id: ItemId,
    );

    /// A shared copy of `id` arrived
    fn received(
        &self,
        id: ItemId,
        version: u64,
        data: &Bytes,
    );

    fn evicted(
        &self,
        id: ItemId,
    );

    /// The node believed to own `id` left the cluster without a successor
    fn killed(
        &self,
        id: ItemId,
    );

    /// A messenger payload addressed to `id` (or to this node when `None`)
    fn message_received(
        &self,
        id: Option<ItemId>,
        from: NodeId,
        topic: Topic,
        data: &Bytes,
    );
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl CacheListener for NoopListener {
    fn invalidated(
        &self,
        _id: ItemId,
    ) {
    }

    fn received(
        &self,
        _id: ItemId,
        _version: u64,
        _data: &Bytes,
    ) {
    }

    fn evicted(
        &self,
        _id: ItemId,
    ) {
    }

    fn killed(
        &self,
        _id: ItemId,
    ) {
    }

    fn message_received(
        &self,
        _id: Option<ItemId>,
        _from: NodeId,
        _topic: Topic,
        _data: &Bytes,
    ) {
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Invalidated(ItemId),
    Received {
        id: ItemId,
        version: u64,
        data: Bytes,
    },
    Evicted(ItemId),
    Killed(ItemId),
    MessageReceived {
        id: Option<ItemId>,
        from: NodeId,
        topic: Topic,
        data: Bytes,
    },
}

impl ListenerEvent {
    pub fn dispatch(
        &self,
        listener: &dyn CacheListener,
    ) {
        match self {
            ListenerEvent::Invalidated(id) => listener.invalidated(*id),
            ListenerEvent::Received { id, version, data } => listener.received(*id, *version, data),
            ListenerEvent::Evicted(id) => listener.evicted(*id),
            ListenerEvent::Killed(id) => listener.killed(*id),
            ListenerEvent::MessageReceived {
                id,
                from,
                topic,
                data,
            } => listener.message_received(*id, *from, *topic, data),
        }
    }
}

/// Forwards every callback as a [`ListenerEvent`] into a channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(
        &self,
        event: ListenerEvent,
    ) {
        // receiver dropped means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

impl CacheListener for ChannelListener {
    fn invalidated(
        &self,
        id: ItemId,
    ) {
        self.emit(ListenerEvent::Invalidated(id));
    }

    fn received(
        &self,
        id: ItemId,
        version: u64,
        data: &Bytes,
    ) {
        self.emit(ListenerEvent::Received {
            id,
            version,
            data: data.clone(),
        });
    }

    fn evicted(
        &self,
        id: ItemId,
    ) {
        self.emit(ListenerEvent::Evicted(id));
    }

    fn killed(
        &self,
        id: ItemId,
    ) {
        self.emit(ListenerEvent::Killed(id));
    }

    fn message_received(
        &self,
        id: Option<ItemId>,
        from: NodeId,
        topic: Topic,
        data: &Bytes,
    ) {
        self.emit(ListenerEvent::MessageReceived {
            id,
            from,
            topic,
            data: data.clone(),
        });
    }
}
