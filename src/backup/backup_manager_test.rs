use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;

use super::*;
use crate::BackupConfig;
use crate::Connection;
use crate::Delivery;
use crate::LocalNetwork;
use crate::GridError;
use crate::MemberId;
use crate::Message;
use crate::MessageType;
use crate::PendingReplies;
use crate::ProtocolError;
use crate::ReplicationMode;

struct Member {
    manager: Arc<BackupManager>,
    _pump: JoinHandle<()>,
}

/// Wires a manager to its inbox: acks complete pending replies, packets are applied.
fn member(
    conn: Connection,
    config: BackupConfig,
) -> Member {
    let pending = Arc::new(PendingReplies::new());
    let manager = Arc::new(BackupManager::new(
        config,
        conn.transport.clone(),
        conn.cluster.clone(),
        pending.clone(),
    ));
    let mut inbox = conn.inbox;
    let transport = conn.transport;
    let m = manager.clone();
    let pump = tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            match msg.kind {
                MessageType::Backup => {
                    let ack = m.handle_packet(&msg).unwrap();
                    let _ = transport.send(ack).await;
                }
                _ => {
                    pending.complete(msg);
                }
            }
        }
    });
    Member { manager, _pump: pump }
}

fn config(mode: ReplicationMode) -> BackupConfig {
    BackupConfig {
        mode,
        flush_interval_ms: 5,
        replication_factor: 1,
        ack_timeout_ms: 100,
    }
}

#[tokio::test]
async fn test_latest_record_wins_in_batch() {
    let net = LocalNetwork::new();
    let m = member(net.join(1).unwrap(), config(ReplicationMode::Async));

    m.manager.record_owned(7, 1, &Bytes::from_static(b"a"));
    m.manager.record_owned(7, 2, &Bytes::from_static(b"b"));
    m.manager.record_released(8);

    assert_eq!(m.manager.batched(), 2);
}

#[tokio::test]
async fn test_flush_reaches_slave_shadow() {
    let net = LocalNetwork::new();
    let master = member(net.join(1).unwrap(), config(ReplicationMode::Sync));
    let slave = member(net.join(1).unwrap(), config(ReplicationMode::Sync));

    master.manager.record_owned(7, 3, &Bytes::from_static(b"seven"));
    master.manager.record_owned(9, 1, &Bytes::from_static(b"nine"));
    master.manager.sync().await.unwrap();

    assert_eq!(slave.manager.applied_seq(), 1);
    assert_eq!(slave.manager.shadow_len(), 2);

    master.manager.record_deleted(9);
    master.manager.sync().await.unwrap();
    let mut shadow = slave.manager.take_shadow();
    shadow.sort_by_key(|(id, _, _)| *id);
    assert_eq!(shadow, vec![(7, 3, Bytes::from_static(b"seven"))]);
}

#[tokio::test]
async fn test_slave_records_nothing() {
    let net = LocalNetwork::new();
    let _master = member(net.join(1).unwrap(), config(ReplicationMode::Async));
    let slave = member(net.join(1).unwrap(), config(ReplicationMode::Async));

    slave.manager.record_owned(1, 1, &Bytes::from_static(b"x"));

    assert_eq!(slave.manager.batched(), 0);
}

#[tokio::test]
async fn test_sync_without_ack_keeps_change_queued() {
    let net = LocalNetwork::new();
    let master = member(net.join(1).unwrap(), config(ReplicationMode::Sync));
    // a slave whose inbox nobody reads
    let silent = net.join(1).unwrap();
    let silent_member = silent.cluster.member_id();

    master.manager.record_owned(1, 1, &Bytes::from_static(b"x"));
    let err = master.manager.sync().await.unwrap_err();

    assert!(matches!(
        err,
        crate::Error::Grid(GridError::NotReplicated { acked: 0, needed: 1 })
    ));
    assert_eq!(master.manager.batched(), 0);
    assert_eq!(master.manager.unacked(silent_member), 1);
}

#[tokio::test]
async fn test_lost_acks_are_repaired_by_next_flush() {
    let net = LocalNetwork::new();
    let master = member(net.join(1).unwrap(), config(ReplicationMode::Sync));
    let slave_conn = net.join(1).unwrap();
    let slave_member = slave_conn.cluster.member_id();
    let slave = member(slave_conn, config(ReplicationMode::Sync));

    net.set_interceptor(Some(Arc::new(|m: &Message| {
        if m.kind == MessageType::Backup {
            Delivery::Drop
        } else {
            Delivery::Deliver
        }
    })));
    master.manager.record_owned(1, 1, &Bytes::from_static(b"x"));
    assert!(master.manager.sync().await.is_err());
    assert_eq!(slave.manager.shadow_len(), 0);

    net.set_interceptor(None);
    master.manager.flush().await.unwrap();

    assert_eq!(master.manager.unacked(slave_member), 0);
    assert_eq!(slave.manager.take_shadow(), vec![(1, 1, Bytes::from_static(b"x"))]);
}

#[tokio::test]
async fn test_late_slave_does_not_stall_earlier_one() {
    let net = LocalNetwork::new();
    let master = member(net.join(1).unwrap(), config(ReplicationMode::Sync));
    let first = member(net.join(1).unwrap(), config(ReplicationMode::Sync));

    master.manager.record_owned(1, 1, &Bytes::from_static(b"a"));
    master.manager.sync().await.unwrap();
    master.manager.record_owned(2, 1, &Bytes::from_static(b"b"));
    master.manager.sync().await.unwrap();

    let late_conn = net.join(1).unwrap();
    let late_member = late_conn.cluster.member_id();
    let late = member(late_conn, config(ReplicationMode::Sync));
    master.manager.full_sync(late_member).await.unwrap();

    master.manager.record_owned(3, 1, &Bytes::from_static(b"c"));
    master.manager.sync().await.unwrap();

    assert_eq!(first.manager.shadow_len(), 3);
    assert_eq!(first.manager.applied_seq(), 3);
    assert_eq!(late.manager.shadow_len(), 1);
    assert_eq!(master.manager.unacked(late_member), 0);
}

#[tokio::test]
async fn test_delta_from_unknown_master_asks_for_image() {
    let net = LocalNetwork::new();
    let slave = member(net.join(1).unwrap(), config(ReplicationMode::Async));

    let packet = |source: MemberId, seq: u64, full: bool, version: u64| {
        let payload = BackupPacket {
            source,
            seq,
            full,
            records: vec![BackupRecord::Owned {
                id: 5,
                version,
                data: vec![version as u8],
            }],
        }
        .encode()
        .unwrap();
        Message::new(MessageType::Backup, 1, 1).with_seq(seq).with_data(payload)
    };

    let reply = slave.manager.handle_packet(&packet(7, 4, false, 1)).unwrap();
    assert_eq!(reply.kind, MessageType::Nack);
    assert_eq!(slave.manager.shadow_len(), 0);

    let reply = slave.manager.handle_packet(&packet(7, 5, true, 2)).unwrap();
    assert_eq!(reply.kind, MessageType::BackupAck);
    slave.manager.handle_packet(&packet(7, 6, false, 3)).unwrap();

    // a replayed packet must not roll the item back
    let reply = slave.manager.handle_packet(&packet(7, 5, true, 2)).unwrap();
    assert_eq!(reply.kind, MessageType::BackupAck);
    assert_eq!(slave.manager.applied_seq(), 6);

    // another master starts its own numbering and needs an image first
    let reply = slave.manager.handle_packet(&packet(8, 1, false, 9)).unwrap();
    assert_eq!(reply.kind, MessageType::Nack);
    assert_eq!(slave.manager.take_shadow(), vec![(5, 3, Bytes::from_static(&[3]))]);
}

#[tokio::test]
async fn test_full_sync_replaces_shadow() {
    let net = LocalNetwork::new();
    let master = member(net.join(1).unwrap(), config(ReplicationMode::Async));
    master
        .manager
        .set_image_source(Arc::new(|| vec![(3, 4, Bytes::from_static(b"img"))]));
    let slave_conn = net.join(1).unwrap();
    let slave_member = slave_conn.cluster.member_id();
    let slave = member(slave_conn, config(ReplicationMode::Async));

    master.manager.full_sync(slave_member).await.unwrap();

    assert_eq!(slave.manager.take_shadow(), vec![(3, 4, Bytes::from_static(b"img"))]);
}

#[test]
fn test_malformed_packet_is_rejected() {
    let msg = Message::new(MessageType::Backup, 1, 1).with_data(Bytes::from_static(&[0xFF, 0x01]));
    let pending = Arc::new(PendingReplies::new());
    let net = LocalNetwork::new();
    let conn = net.join(1).unwrap();
    let manager = BackupManager::new(
        config(ReplicationMode::Async),
        conn.transport,
        conn.cluster,
        pending,
    );

    assert!(matches!(manager.handle_packet(&msg), Err(ProtocolError::BadPacket(_))));
}
