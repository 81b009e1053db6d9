//! Topic messages between nodes, addressed to a node or to the owner of an item.
mod messenger;

pub use messenger::*;
