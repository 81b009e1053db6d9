//! Backing store of owner records, item contents and id allocations.
mod adaptors;
mod main_memory_db;

pub use adaptors::*;
pub use main_memory_db::*;


use std::sync::Arc;

use crate::GridConfig;
use crate::Result;
use crate::StorageBackend;

/// Opens the store selected by `storage.backend`.
pub fn open_main_memory_db(config: &GridConfig) -> Result<Arc<dyn MainMemoryDb>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemMainMemoryDb::new())),
        StorageBackend::Sled => {
            let db = init_sled_main_memory_db(&config.storage.sled_path, &config.storage)?;
            Ok(Arc::new(SledMainMemoryDb::new(db)?))
        }
    }
}
