//! Master to slave replication of owned lines and slave promotion.
mod backup_manager;
mod record;

pub use backup_manager::*;
pub use record::*;

#[cfg(test)]
mod backup_manager_test;
