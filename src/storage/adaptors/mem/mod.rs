mod mem_main_memory_db;

pub use mem_main_memory_db::*;

#[cfg(test)]
mod mem_main_memory_db_test;
