use std::sync::Arc;
use std::time::Duration;

use grid_engine::ChannelListener;
use grid_engine::Delivery;
use grid_engine::Error;
use grid_engine::GridError;
use grid_engine::ListenerEvent;
use grid_engine::MessageType;
use grid_engine::ReplicationMode;
use grid_engine::SERVER;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::common::bytes;
use crate::common::TestCluster;

#[tokio::test]
async fn test_readers_recover_when_owner_dies() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2]).await;
    let (a, b) = (&grids[0], &grids[1]);

    // the stored image survives the owner
    let id = a.store().put(bytes("v1")).await.unwrap();
    a.store().release(id).await.unwrap();
    a.store().getx(id).await.unwrap();
    assert_eq!(b.store().get(id).await.unwrap(), bytes("v1"));
    let (listener, mut events) = ChannelListener::new();
    b.store().listen(id, Arc::new(listener));

    cluster.net.kill(1, a.member_id()).unwrap();

    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(event, Some(ListenerEvent::Killed(id)));
    assert_eq!(b.engine().directory().owner_of(id).unwrap(), Some(SERVER));

    // the next read claims the item from the store
    let data = timeout(Duration::from_secs(2), b.store().get(id)).await.unwrap().unwrap();
    assert_eq!(data, bytes("v1"));
    assert_eq!(b.engine().directory().owner_of(id).unwrap(), Some(2));
}

#[tokio::test]
async fn test_request_to_silent_owner_times_out() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let b = cluster.start(2);
    crate::common::wait_available(&b).await;
    // node 1 is joined but never answers
    let _silent = cluster.net.join(1).unwrap();
    cluster.db.cas_owner(5, None, 1).unwrap();

    let err = timeout(Duration::from_secs(10), b.store().get(5)).await.unwrap().unwrap_err();

    assert!(matches!(err, Error::Grid(GridError::Timeout { id: 5, .. })));
    assert!(b.store().stats().timeouts > 0);
}

#[tokio::test]
async fn test_getx_in_flight_when_owner_dies() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2]).await;
    let (a, b) = (&grids[0], &grids[1]);
    let id = a.store().put(bytes("v1")).await.unwrap();
    a.store().release(id).await.unwrap();
    a.store().getx(id).await.unwrap();

    // the request never reaches the owner, so B is mid-exchange when it dies
    cluster.net.set_interceptor(Some(Arc::new(|msg| {
        if msg.kind == MessageType::GetX && msg.to == 1 {
            Delivery::Drop
        } else {
            Delivery::Deliver
        }
    })));
    let kill = async {
        sleep(Duration::from_millis(50)).await;
        cluster.net.kill(1, a.member_id()).unwrap();
    };
    let (result, ()) = timeout(Duration::from_secs(10), async { tokio::join!(b.store().getx(id), kill) })
        .await
        .expect("exchange ends after the owner is gone");

    match result {
        Ok(_) => assert_eq!(b.store().get(id).await.unwrap(), bytes("v1")),
        Err(e) => assert!(matches!(e, Error::Grid(GridError::Timeout { .. })), "{e:?}"),
    }
    assert_eq!(b.engine().snapshot(id).unwrap().pending, None);
}
