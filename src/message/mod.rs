//! Protocol messages, request/reply matching and the wire codec.
pub mod codec;
#[allow(clippy::module_inception)]
mod message;
mod pending_replies;

pub use message::*;
pub use pending_replies::*;
