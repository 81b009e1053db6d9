use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grid_engine::ChannelListener;
use grid_engine::Delivery;
use grid_engine::ListenerEvent;
use grid_engine::MessageType;
use grid_engine::ReplicationMode;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::common::bytes;
use crate::common::wait_available;
use crate::common::TestCluster;

const TOPIC: u32 = 11;

#[tokio::test]
async fn test_duplicated_traffic_keeps_items_coherent() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    cluster.net.set_interceptor(Some(Arc::new(|_| Delivery::Duplicate)));
    let grids = cluster.start_masters(&[1, 2, 3]).await;

    let id = grids[0].store().put(bytes("v0")).await.unwrap();
    for (i, grid) in grids.iter().enumerate() {
        assert_eq!(grid.store().get(id).await.unwrap(), bytes(&format!("v{i}")));
        grid.store().set(id, bytes(&format!("v{}", i + 1)), None).await.unwrap();
    }
    for grid in &grids {
        assert_eq!(grid.store().get(id).await.unwrap(), bytes("v3"));
    }

    grids[1].store().del(id, None).await.unwrap();
    assert!(grids[2].store().get(id).await.is_err());
}

#[tokio::test]
async fn test_duplicated_messages_are_delivered_once_in_order() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2]).await;
    let (a, b) = (&grids[0], &grids[1]);
    let (listener, mut events) = ChannelListener::new();
    b.messenger().subscribe(TOPIC, Arc::new(listener));

    cluster.net.set_interceptor(Some(Arc::new(|msg| {
        if msg.kind == MessageType::Msg {
            Delivery::Duplicate
        } else {
            Delivery::Deliver
        }
    })));
    for i in 0..5u8 {
        a.messenger().send_to_node(2, TOPIC, Bytes::from(vec![i])).await.unwrap();
    }

    for i in 0..5u8 {
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ListenerEvent::MessageReceived { from, topic, data, .. }) => {
                assert_eq!((from, topic), (1, TOPIC));
                assert_eq!(data, Bytes::from(vec![i]));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err(), "a duplicate was delivered");
}

#[tokio::test]
async fn test_dropped_messages_are_retransmitted() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let grids = cluster.start_masters(&[1, 2]).await;
    let (a, b) = (&grids[0], &grids[1]);
    let (listener, mut events) = ChannelListener::new();
    b.messenger().subscribe(TOPIC, Arc::new(listener));

    // every first transmission of a message is lost
    let dropped = Arc::new(parking_lot::Mutex::new(std::collections::HashSet::new()));
    let seen = dropped.clone();
    cluster.net.set_interceptor(Some(Arc::new(move |msg| {
        if msg.kind == MessageType::Msg && seen.lock().insert(msg.seq) {
            Delivery::Drop
        } else {
            Delivery::Deliver
        }
    })));

    a.messenger().send_to_node(2, TOPIC, bytes("late")).await.unwrap();

    match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
        Some(ListenerEvent::MessageReceived { data, .. }) => assert_eq!(data, bytes("late")),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(dropped.lock().len(), 1);
}

#[tokio::test]
async fn test_promoted_member_messages_are_not_taken_for_duplicates() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let master = cluster.start(1);
    let slave = cluster.start(1);
    let receiver = cluster.start(2);
    wait_available(&master).await;
    wait_available(&receiver).await;
    let (listener, mut events) = ChannelListener::new();
    receiver.messenger().subscribe(TOPIC, Arc::new(listener));

    for i in 0..10u8 {
        master.messenger().send_to_node(2, TOPIC, Bytes::from(vec![i])).await.unwrap();
    }
    cluster.net.kill(1, master.member_id()).unwrap();
    wait_available(&slave).await;
    slave.messenger().send_to_node(2, TOPIC, bytes("after-failover")).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 11 {
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(ListenerEvent::MessageReceived { from, data, .. }) => {
                assert_eq!(from, 1);
                received.push(data);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(received.last(), Some(&bytes("after-failover")));
}

#[tokio::test]
async fn test_message_sent_during_takeover_is_delivered() {
    let cluster = TestCluster::new(ReplicationMode::Async);
    let master = cluster.start(1);
    let slave = cluster.start(1);
    let sender = cluster.start(2);
    wait_available(&master).await;
    wait_available(&sender).await;
    let (listener, mut events) = ChannelListener::new();
    slave.messenger().subscribe(TOPIC, Arc::new(listener));

    // the promoted member NACKs until it serves, and the sender retries
    cluster.net.kill(1, master.member_id()).unwrap();
    sender.messenger().send_to_node(1, TOPIC, bytes("takeover")).await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ListenerEvent::MessageReceived { from, data, .. }) => {
            assert_eq!((from, data), (2, bytes("takeover")));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(slave.is_master());
}
