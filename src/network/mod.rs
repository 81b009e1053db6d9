//! Message transport between grid members.
//!
//! The grid only needs per sender/receiver FIFO delivery; nothing is assumed
//! about ordering across different peers. [`LocalNetwork`] is the in-process
//! implementation used by the binary and the tests.
mod local;

pub use local::*;


use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use crate::Cluster;
use crate::MemberId;
use crate::Message;
use crate::NodeId;
use crate::Result;
use std::sync::Arc;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Node group this endpoint belongs to
    fn node_id(&self) -> NodeId;

    /// Delivers `msg` to the current master member of `msg.to`.
    ///
    /// # Errors
    /// - `NetworkError::NodeUnreachable` when the group has no live member
    /// - `NetworkError::Disconnected` when this endpoint left the cluster
    async fn send(
        &self,
        msg: Message,
    ) -> Result<()>;

    /// Delivers `msg` to one member of `msg.to`, master or slave.
    async fn send_to_member(
        &self,
        member: MemberId,
        msg: Message,
    ) -> Result<()>;
}

/// Handles a member receives when it joins the cluster.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub cluster: Arc<dyn Cluster>,
    /// Messages addressed to this member, in per-sender order
    pub inbox: mpsc::UnboundedReceiver<Message>,
}
