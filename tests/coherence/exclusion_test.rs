use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use grid_engine::Delivery;
use grid_engine::LineState;
use grid_engine::MessageType;
use grid_engine::ReplicationMode;

use crate::common::bytes;
use crate::common::TestCluster;

const WRITES_PER_NODE: u64 = 20;

/// Concurrent writers on three nodes: every write gets its own version, so
/// no two nodes were ever exclusive owners of the same version.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writers_on_three_nodes_never_share_a_version() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids: Vec<Arc<grid_engine::Grid>> = cluster
        .start_masters(&[1, 2, 3])
        .await
        .into_iter()
        .map(Arc::new)
        .collect();
    let id = grids[0].store().put(bytes("start")).await.unwrap();

    let writers = grids.iter().map(|grid| {
        let grid = grid.clone();
        tokio::spawn(async move {
            let mut versions = Vec::new();
            for i in 0..WRITES_PER_NODE {
                let data = Bytes::from(format!("{}:{}", grid.node_id(), i));
                versions.push(grid.store().set(id, data, None).await.unwrap());
            }
            versions
        })
    });
    let mut versions = Vec::new();
    for writer in futures::future::join_all(writers).await {
        versions.extend(writer.unwrap());
    }

    let distinct: BTreeSet<u64> = versions.iter().copied().collect();
    assert_eq!(distinct.len(), versions.len(), "a version was written twice");
    let last = *distinct.iter().max().unwrap();
    assert_eq!(last, 1 + 3 * WRITES_PER_NODE);

    let owners = grids
        .iter()
        .filter(|g| g.engine().snapshot(id).map(|l| l.state) == Some(LineState::Owned))
        .count();
    assert_eq!(owners, 1);

    // every node converges on the last write
    let expected = grids[0].store().get(id).await.unwrap();
    for grid in &grids {
        assert_eq!(grid.store().get(id).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_read_your_writes_across_nodes() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2, 3]).await;
    let id = grids[0].store().put(bytes("v0")).await.unwrap();
    for grid in &grids {
        grid.store().get(id).await.unwrap();
    }

    for (round, grid) in grids.iter().enumerate() {
        let data = bytes(&format!("v{}", round + 1));
        grid.store().set(id, data.clone(), None).await.unwrap();
        assert_eq!(grid.store().get(id).await.unwrap(), data);
        for other in &grids {
            assert_eq!(other.store().get(id).await.unwrap(), data);
        }
    }
}

#[tokio::test]
async fn test_transaction_is_invisible_until_commit() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2]).await;
    let (a, b) = (&grids[0], &grids[1]);
    let x = a.store().put(bytes("x0")).await.unwrap();
    let y = a.store().put(bytes("y0")).await.unwrap();

    let txn = a.store().begin_transaction().unwrap();
    a.store().set(x, bytes("x1"), Some(&txn)).await.unwrap();
    a.store().del(y, Some(&txn)).await.unwrap();
    assert_eq!(cluster.db.read(x).unwrap(), None);
    a.store().commit(&txn).await.unwrap();

    assert_eq!(cluster.db.read(x).unwrap().map(|(_, d)| d), Some(bytes("x1")));
    assert_eq!(b.store().get(x).await.unwrap(), bytes("x1"));
    assert!(b.store().get(y).await.is_err());
}

#[tokio::test]
async fn test_owner_record_moves_before_ownership_is_granted() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2, 3]).await;
    let (a, b, c) = (&grids[0], &grids[1], &grids[2]);
    let id = a.store().put(bytes("v1")).await.unwrap();
    a.store().set(id, bytes("v2"), None).await.unwrap();

    let at_grant = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (db, seen) = (cluster.db.clone(), at_grant.clone());
    cluster.net.set_interceptor(Some(Arc::new(move |msg| {
        if msg.kind == MessageType::PutX {
            seen.lock().push(db.owner(id).unwrap());
        }
        Delivery::Deliver
    })));
    b.store().getx(id).await.unwrap();
    cluster.net.set_interceptor(None);

    // an old owner that forgot the line finds the requester in the directory
    assert_eq!(*at_grant.lock(), vec![Some(2)]);
    assert_eq!(cluster.db.read(id).unwrap().map(|(_, d)| d), Some(bytes("v2")));
    assert_eq!(a.engine().snapshot(id).unwrap().state, LineState::Invalid);
    assert_eq!(c.store().get(id).await.unwrap(), bytes("v2"));
}
