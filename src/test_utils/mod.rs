//! Fixtures shared by the unit tests: fast retry settings and engines
//! wired to an in-process network.
mod common;
mod harness;

pub use common::*;
pub use harness::*;
