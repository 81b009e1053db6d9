use crate::MemberId;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node group got its first member
    NodeAdded(NodeId),
    /// The last member of a node group left
    NodeRemoved(NodeId),
    /// A slave of the node group took over after its master left
    NodeSwitched(NodeId),
    /// A slave joined this node group (delivered to the master)
    SlaveAdded(MemberId),
    /// A slave left this node group (delivered to the master)
    SlaveRemoved(MemberId),
    JoinedCluster,
    Online { master: bool },
    Offline,
    /// This member became the master of its node group
    SwitchToMaster,
}
