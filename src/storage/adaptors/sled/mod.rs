mod sled_main_memory_db;

pub use sled_main_memory_db::*;

#[cfg(test)]
mod sled_main_memory_db_test;

use std::path::Path;

use tracing::debug;
use tracing::warn;

use crate::Result;
use crate::StorageConfig;

/// Opens the sled database backing [`SledMainMemoryDb`].
#[doc(hidden)]
pub fn init_sled_main_memory_db(
    sled_db_root_path: impl AsRef<Path> + std::fmt::Debug,
    config: &StorageConfig,
) -> Result<sled::Db> {
    debug!("init_sled_main_memory_db from path: {:?}", &sled_db_root_path);

    let path = sled_db_root_path.as_ref();

    sled::Config::default()
        .path(path)
        .cache_capacity(config.cache_capacity)
        .flush_every_ms(Some(config.flush_every_ms))
        .use_compression(true)
        .compression_factor(1)
        .mode(sled::Mode::HighThroughput)
        .open()
        .map_err(|e| {
            warn!(
                "Try to open DB at this location: {:?} and failed: {:?}",
                path, e
            );
            e.into()
        })
}
