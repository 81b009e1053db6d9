mod builder;
mod dispatcher;
mod grid;
mod store;

pub use builder::*;
pub(crate) use dispatcher::*;
pub use grid::*;
pub use store::*;
