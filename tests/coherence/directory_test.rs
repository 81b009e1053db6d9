use std::sync::Arc;

use grid_engine::init_sled_main_memory_db;
use grid_engine::CasOutcome;
use grid_engine::MainMemoryDb;
use grid_engine::OwnerDirectory;
use grid_engine::SledMainMemoryDb;
use grid_engine::StorageConfig;
use grid_engine::SERVER;
use tempfile::TempDir;

fn sled_directory() -> (TempDir, OwnerDirectory) {
    let dir = tempfile::tempdir().unwrap();
    let db = init_sled_main_memory_db(dir.path().join("owners"), &StorageConfig::default()).unwrap();
    let db: Arc<dyn MainMemoryDb> = Arc::new(SledMainMemoryDb::new(db).unwrap());
    (dir, OwnerDirectory::new(db))
}

#[test]
fn test_cas_on_empty_directory_creates_record_once() {
    crate::enable_logger();
    let (_dir, directory) = sled_directory();

    assert_eq!(directory.cas_owner(42, None, 3).unwrap(), CasOutcome::Success(3));
    // the record exists now: the stored owner comes back, not 5
    assert_eq!(directory.cas_owner(42, None, 5).unwrap(), CasOutcome::Conflict(3));
    assert_eq!(directory.owner_of(42).unwrap(), Some(3));
}

#[test]
fn test_remove_owner_only_releases_that_node() {
    crate::enable_logger();
    let (_dir, directory) = sled_directory();
    for id in [10, 20, 30] {
        directory.cas_owner(id, None, 3).unwrap();
    }
    directory.cas_owner(40, None, 4).unwrap();

    directory.remove_owner(3).unwrap();

    for id in [10, 20, 30] {
        assert_eq!(directory.db().owner(id).unwrap(), Some(SERVER));
    }
    assert_eq!(directory.db().owner(40).unwrap(), Some(4));
}

#[test]
fn test_concurrent_cas_has_one_winner() {
    crate::enable_logger();
    let (_dir, directory) = sled_directory();
    directory.cas_owner(7, None, SERVER).unwrap();

    let outcomes: Vec<CasOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = (1..=16u16)
            .map(|node| {
                let directory = directory.clone();
                s.spawn(move || directory.cas_owner(7, Some(SERVER), node).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&CasOutcome> = outcomes.iter().filter(|o| o.is_success()).collect();
    assert_eq!(winners.len(), 1);
    let owner = directory.owner_of(7).unwrap().unwrap();
    assert!(outcomes.iter().all(|o| matches!(o, CasOutcome::Success(n) | CasOutcome::Conflict(n) if *n == owner)));
}
