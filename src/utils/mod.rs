pub(crate) mod async_task;
pub mod convert;
mod keyed_executor;
mod linked_map;

pub use keyed_executor::*;
pub use linked_map::*;

#[cfg(test)]
mod async_task_test;
#[cfg(test)]
mod utils_test;
