use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::result::Result;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing_test::traced_test;

use super::*;
use crate::storage::main_memory_db_test::MainMemoryDbBuilder;
use crate::storage::main_memory_db_test::MainMemoryDbTestSuite;
use crate::Error;
use crate::MainMemoryDb;
use crate::NodeId;
use crate::StorageConfig;

struct SledMainMemoryDbBuilder {
    temp_dir: TempDir,
    next: AtomicUsize,
}

#[async_trait]
impl MainMemoryDbBuilder for SledMainMemoryDbBuilder {
    type Db = SledMainMemoryDb;

    async fn build(&self) -> Result<Arc<Self::Db>, Error> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let path = self.temp_dir.path().join(format!("db_{n}"));
        let db = init_sled_main_memory_db(&path, &StorageConfig::default())?;
        Ok(Arc::new(SledMainMemoryDb::new(db)?))
    }

    async fn cleanup(&self) -> Result<(), Error> {
        // TempDir removes everything when dropped
        Ok(())
    }
}

#[tokio::test]
#[traced_test]
async fn test_sled_main_memory_db() -> Result<(), Error> {
    let temp_dir = TempDir::new()?;
    MainMemoryDbTestSuite::run_all_tests(SledMainMemoryDbBuilder {
        temp_dir,
        next: AtomicUsize::new(0),
    })
    .await
}

/// # Case: restart
///
/// ## Setup:
/// 1. owner record, contents and an allocation are written
/// 2. the db is closed and reopened from the same path
///
/// ## Criterias:
/// 1. everything is found again
#[test]
fn test_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("reopen");
    {
        let db = SledMainMemoryDb::new(
            init_sled_main_memory_db(&path, &StorageConfig::default()).unwrap(),
        )
        .unwrap();
        db.write(5, 2, 9, b"persisted", None).unwrap();
        db.allocate(2, 1000, 100).unwrap();
        db.close().unwrap();
    }

    let db = SledMainMemoryDb::new(
        init_sled_main_memory_db(&path, &StorageConfig::default()).unwrap(),
    )
    .unwrap();
    assert_eq!(db.owner(5).unwrap(), Some(2));
    assert_eq!(&db.read(5).unwrap().unwrap().1[..], b"persisted");
    assert_eq!(db.find_allocation(1050).unwrap(), Some(2));
    assert!(db.allocate(3, 1000, 1).is_err());
}

/// # Case: racing allocations of the same range
///
/// ## Criterias:
/// 1. exactly one allocation wins
/// 2. the range record belongs to the winner and the high-water mark covers it
/// 3. a rejected allocation leaves no record behind
#[test]
fn test_allocation_is_atomic() {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(
        SledMainMemoryDb::new(
            init_sled_main_memory_db(&temp_dir.path().join("alloc"), &StorageConfig::default()).unwrap(),
        )
        .unwrap(),
    );

    let results: Vec<(NodeId, bool)> = std::thread::scope(|s| {
        let handles: Vec<_> = (1..=8u16)
            .map(|node| {
                let db = db.clone();
                s.spawn(move || (node, db.allocate(node, 100, 50).is_ok()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<NodeId> = results.iter().filter(|(_, ok)| *ok).map(|(n, _)| *n).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(db.find_allocation(149).unwrap(), Some(winners[0]));
    assert_eq!(db.high_water().unwrap(), 150);

    assert!(db.allocate(9, 120, 100).is_err());
    assert_eq!(db.find_allocation(200).unwrap(), None);
    assert_eq!(db.high_water().unwrap(), 150);
}
