//! Identifier types shared by every subsystem.

/// Globally unique identifier of a grid item.
pub type ItemId = u64;

/// Identifier of a node group. Master and slaves of a group share it.
///
/// `0` is reserved for [`SERVER`](crate::SERVER): "no node owns the item".
pub type NodeId = u16;

/// Identifier of one process inside a node group.
pub type MemberId = u16;

/// Application-defined message topic used by the [`Messenger`](crate::Messenger).
pub type Topic = u32;
