//! Owner directory: who owns which item.
//!
//! A thin layer over [`MainMemoryDb`](crate::MainMemoryDb) that adds the
//! allocation-range fallback for lookups and bounded CAS retry helpers.
//! Store failures are propagated unchanged; retries on I/O errors belong to
//! the coherence engine.
mod owner_directory;

pub use owner_directory::*;
