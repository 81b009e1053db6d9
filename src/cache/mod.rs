//! Per-member cache of grid items and the coherence protocol that keeps
//! the copies consistent.
mod engine;
mod line;
mod listener;
mod protocol;
mod stats;
mod transactions;

pub use engine::*;
pub use line::*;
pub use listener::*;
pub use stats::*;
pub use transactions::TxnHandle;
