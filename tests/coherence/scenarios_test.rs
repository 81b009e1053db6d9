use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grid_engine::ChannelListener;
use grid_engine::LineState;
use grid_engine::ListenerEvent;
use grid_engine::ReplicationMode;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::common::TestCluster;

const A: u16 = 1;
const B: u16 = 2;

/// Item 1 stored at version 5 with owner B, and B holding it exclusively.
async fn owned_by_b(cluster: &TestCluster) -> (grid_engine::Grid, grid_engine::Grid) {
    cluster.db.write(1, B, 5, &[0xAA], None).unwrap();
    cluster.db.cas_owner(1, None, B).unwrap();
    let grids = cluster.start_masters(&[A, B]).await;
    let mut grids = grids.into_iter();
    let (a, b) = (grids.next().unwrap(), grids.next().unwrap());

    assert_eq!(b.store().getx(1).await.unwrap(), 5);
    (a, b)
}

#[tokio::test]
async fn test_get_on_invalid_line_fetches_shared_copy() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let (a, b) = owned_by_b(&cluster).await;
    let (listener, mut events) = ChannelListener::new();
    a.store().listen(1, Arc::new(listener));

    let data = a.store().get(1).await.unwrap();

    assert_eq!(data, Bytes::from_static(&[0xAA]));
    let line = a.engine().snapshot(1).unwrap();
    assert_eq!(line.state, LineState::Shared);
    assert_eq!(line.version, 5);
    assert_eq!(b.engine().snapshot(1).unwrap().state, LineState::Owned);

    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(ListenerEvent::Received {
            id: 1,
            version: 5,
            data: Bytes::from_static(&[0xAA]),
        })
    );
    sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err(), "received fires exactly once");
}

#[tokio::test]
async fn test_getx_then_set_needs_no_messages() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let (a, b) = owned_by_b(&cluster).await;
    a.store().get(1).await.unwrap();

    assert_eq!(a.store().getx(1).await.unwrap(), 5);
    assert_eq!(a.engine().snapshot(1).unwrap().state, LineState::Owned);
    assert_eq!(b.engine().snapshot(1).unwrap().state, LineState::Invalid);

    let sent_before = a.store().stats().total_sent();
    let version = a.store().set(1, Bytes::from_static(&[0xBB]), None).await.unwrap();

    assert_eq!(version, 6);
    let line = a.engine().snapshot(1).unwrap();
    assert_eq!(line.version, 6);
    assert_eq!(line.data, Some(Bytes::from_static(&[0xBB])));
    assert_eq!(a.store().stats().total_sent(), sent_before, "already exclusive");
}
