//! Cache-coherent in-memory object grid.
//!
//! Items are byte blobs identified by an [`ItemId`]. Every node keeps a
//! line per item it touched, in one of three states: `Invalid`, `Shared`
//! (read-only copy) or `Owned` (exclusive, writable). Ownership is recorded
//! in the backing store through compare-and-swap, copies are kept coherent
//! with GET / GETX / INV exchanges, and a node group's master replicates
//! its owned lines to its slaves so one of them can take over.
//!
//! A process joins the grid through [`GridBuilder`], which hands back a
//! [`Grid`] context exposing the [`Store`] API and the [`Messenger`].

mod backup;
mod cache;
mod cluster;
mod config;
mod constants;
mod directory;
mod errors;
mod message;
mod messenger;
mod metrics;
mod network;
mod node;
mod service;
mod storage;
mod type_config;
pub mod utils;

pub use backup::*;
pub use cache::*;
pub use cluster::*;
pub use config::*;
pub use constants::SERVER;
pub use directory::*;
pub use errors::*;
pub use message::*;
pub use messenger::*;
pub use metrics::*;
pub use network::*;
pub use node::*;
pub use service::*;
pub use storage::*;
pub use type_config::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
