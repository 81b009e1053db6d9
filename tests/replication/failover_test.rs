use std::sync::Arc;
use std::time::Duration;

use grid_engine::Delivery;
use grid_engine::Error;
use grid_engine::GridError;
use grid_engine::LineState;
use grid_engine::MessageType;
use grid_engine::ReplicationMode;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::common::bytes;
use crate::common::wait_available;
use crate::common::TestCluster;

/// Waits until the slave applied as many packets as it will get for now.
async fn settle(
    slave: &grid_engine::Grid,
    expected_items: usize,
) {
    timeout(Duration::from_secs(2), async {
        while slave.backup().shadow_len() < expected_items {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backup reached the slave");
}

#[tokio::test]
async fn test_async_replication_survives_master_loss() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let master = cluster.start(1);
    let slave = cluster.start(1);
    let reader = cluster.start(2);
    wait_available(&master).await;
    wait_available(&reader).await;

    let x = master.store().put(bytes("x")).await.unwrap();
    let y = master.store().put(bytes("y")).await.unwrap();
    // async: the write returns before the slave has it
    settle(&slave, 2).await;

    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&slave).await;

    assert!(slave.is_master());
    assert_eq!(slave.engine().snapshot(x).unwrap().state, LineState::Owned);
    // other nodes reach the promoted member under the same node id
    assert_eq!(reader.store().get(x).await.unwrap(), bytes("x"));
    assert_eq!(reader.store().get(y).await.unwrap(), bytes("y"));
}

#[tokio::test]
async fn test_sync_replication_acknowledges_before_returning() {
    let cluster = TestCluster::new(ReplicationMode::Sync);
    let master = cluster.start(1);
    let slave = cluster.start(1);
    wait_available(&master).await;

    let id = master.store().put(bytes("a")).await.unwrap();
    master.store().set(id, bytes("b"), None).await.unwrap();

    // no waiting: set only returned once the slave acknowledged
    assert!(slave.backup().shadow_len() >= 1);
    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&slave).await;
    assert_eq!(slave.store().get(id).await.unwrap(), bytes("b"));
}

#[tokio::test]
async fn test_late_slave_gets_full_image() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let master = cluster.start(1);
    wait_available(&master).await;
    let ids = [
        master.store().put(bytes("one")).await.unwrap(),
        master.store().put(bytes("two")).await.unwrap(),
        master.store().put(bytes("three")).await.unwrap(),
    ];

    let slave = cluster.start(1);
    settle(&slave, ids.len()).await;

    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&slave).await;
    for (id, expected) in ids.iter().zip(["one", "two", "three"]) {
        assert_eq!(slave.store().get(*id).await.unwrap(), bytes(expected));
    }
}

#[tokio::test]
async fn test_first_slave_keeps_applying_after_second_joins() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let master = cluster.start(1);
    let first = cluster.start(1);
    wait_available(&master).await;
    let a = master.store().put(bytes("a")).await.unwrap();
    settle(&first, 1).await;

    let second = cluster.start(1);
    let b = master.store().put(bytes("b")).await.unwrap();
    let c = master.store().put(bytes("c")).await.unwrap();
    settle(&first, 3).await;
    settle(&second, 3).await;

    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&first).await;
    for (id, expected) in [(a, "a"), (b, "b"), (c, "c")] {
        assert_eq!(first.store().get(id).await.unwrap(), bytes(expected));
    }
}

#[tokio::test]
async fn test_readers_see_writes_of_promoted_master() {
    let cluster = TestCluster::new(ReplicationMode::Sync);
    let master = cluster.start(1);
    let slave = cluster.start(1);
    let reader = cluster.start(2);
    wait_available(&master).await;
    wait_available(&reader).await;

    let x = master.store().put(bytes("old")).await.unwrap();
    master.store().set(x, bytes("old2"), None).await.unwrap();
    assert_eq!(reader.store().get(x).await.unwrap(), bytes("old2"));

    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&slave).await;
    // sharers of the dead master are unknown, so every other node counts
    assert!(slave.engine().snapshot(x).unwrap().sharers.contains(&2));

    slave.store().set(x, bytes("new"), None).await.unwrap();
    assert_eq!(reader.store().get(x).await.unwrap(), bytes("new"));
}

#[tokio::test]
async fn test_unreplicated_write_stays_visible_and_queued() {
    let cluster = TestCluster::new(ReplicationMode::Sync);
    let master = cluster.start(1);
    let slave = cluster.start(1);
    wait_available(&master).await;
    let id = master.store().put(bytes("a")).await.unwrap();

    cluster.net.set_interceptor(Some(Arc::new(|msg| {
        if msg.kind == MessageType::Backup {
            Delivery::Drop
        } else {
            Delivery::Deliver
        }
    })));
    let err = master.store().set(id, bytes("b"), None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Grid(GridError::NotReplicated { acked: 0, needed: 1 })
    ));
    // committed here even though the slave missed it
    assert_eq!(master.store().get(id).await.unwrap(), bytes("b"));
    assert!(master.backup().unacked(slave.member_id()) > 0);

    cluster.net.set_interceptor(None);
    timeout(Duration::from_secs(3), async {
        while master.backup().unacked(slave.member_id()) > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued record reached the slave");

    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&slave).await;
    assert_eq!(slave.store().get(id).await.unwrap(), bytes("b"));
}
