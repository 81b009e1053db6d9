//! Cluster membership as seen by one grid member.
//!
//! The grid consumes membership through [`Cluster`]; coordination metadata
//! lives in a [`DistributedTree`]. [`LocalNetwork`](crate::LocalNetwork)
//! provides in-process implementations of both.
mod distributed_tree;
mod event;

pub use distributed_tree::*;
pub use event::*;

#[cfg(test)]
mod distributed_tree_test;

#[cfg(test)]
use mockall::automock;
use tokio::sync::broadcast;

use crate::MemberId;
use crate::NodeId;

#[cfg_attr(test, automock)]
pub trait Cluster: Send + Sync + 'static {
    /// Node group of this member
    fn node_id(&self) -> NodeId;

    fn member_id(&self) -> MemberId;

    /// Whether this member currently serves requests for its node group
    fn is_master(&self) -> bool;

    fn is_online(&self) -> bool;

    /// Node groups with a live master, this one included
    fn nodes(&self) -> Vec<NodeId>;

    /// Live slave members of this node group
    fn slaves(&self) -> Vec<MemberId>;

    fn node_property(
        &self,
        node: NodeId,
        key: &str,
    ) -> Option<String>;

    fn set_node_property(
        &self,
        key: &str,
        value: &str,
    );

    /// Lifecycle events of this member and membership changes of the cluster.
    ///
    /// The first subscriber also receives events raised while joining.
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}
