//! Availability tracking of the grid's internal services.
mod service_graph;

pub use service_graph::*;
