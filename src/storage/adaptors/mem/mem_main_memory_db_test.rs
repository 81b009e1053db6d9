use std::sync::Arc;

use async_trait::async_trait;
use tracing_test::traced_test;

use super::MemMainMemoryDb;
use crate::storage::main_memory_db_test::MainMemoryDbBuilder;
use crate::storage::main_memory_db_test::MainMemoryDbTestSuite;
use crate::Error;
use crate::MainMemoryDb;
use crate::StorageError;
use crate::SystemError;

struct MemMainMemoryDbBuilder;

#[async_trait]
impl MainMemoryDbBuilder for MemMainMemoryDbBuilder {
    type Db = MemMainMemoryDb;

    async fn build(&self) -> Result<Arc<Self::Db>, Error> {
        Ok(Arc::new(MemMainMemoryDb::new()))
    }

    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[tokio::test]
#[traced_test]
async fn test_mem_main_memory_db() -> Result<(), Error> {
    MainMemoryDbTestSuite::run_all_tests(MemMainMemoryDbBuilder).await
}

#[test]
fn test_operations_fail_after_close() {
    let db = MemMainMemoryDb::new();
    db.close().unwrap();

    let e = db.cas_owner(1, None, 1).unwrap_err();
    assert!(matches!(
        e,
        Error::System(SystemError::Storage(StorageError::Closed))
    ));
    assert!(db.read(1).is_err());
}
