use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::convert::node_kv;
use crate::convert::node_vk;
use crate::convert::safe_kv;
use crate::convert::safe_vk;
use crate::Error;
use crate::KeyedExecutor;
use crate::LinkedMap;

#[test]
fn test_safe_kv_roundtrip_keeps_numeric_order() {
    assert_eq!(safe_vk(safe_kv(25)).unwrap(), 25);
    assert_eq!(safe_vk(safe_kv(u64::MAX)).unwrap(), u64::MAX);
    assert!(safe_kv(255) < safe_kv(256));
}

#[test]
fn test_safe_vk_rejects_bad_length() {
    let e = safe_vk([1u8, 2, 3]).unwrap_err();
    assert!(matches!(e, Error::System(_)));
    assert!(node_vk([1u8]).is_err());
    assert_eq!(node_vk(node_kv(7)).unwrap(), 7);
}

#[test]
fn test_linked_map_orders_by_recency() {
    let mut m = LinkedMap::new();
    m.insert(1, "a");
    m.insert(2, "b");
    m.insert(3, "c");
    assert!(m.touch(&1));

    let keys: Vec<_> = m.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![2, 3, 1]);
    assert_eq!(m.front(), Some((&2, &"b")));
    assert_eq!(m.pop_front(), Some((2, "b")));
    assert_eq!(m.len(), 2);
}

#[test]
fn test_linked_map_reuses_slots_after_remove() {
    let mut m = LinkedMap::new();
    for i in 0..10 {
        m.insert(i, i * 10);
    }
    for i in 0..10 {
        if i % 2 == 0 {
            assert_eq!(m.remove(&i), Some(i * 10));
        }
    }
    m.insert(100, 1000);
    let keys: Vec<_> = m.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 3, 5, 7, 9, 100]);
    assert_eq!(m.remove(&42), None);
    assert!(!m.touch(&42));
}

#[test]
fn test_linked_map_update_moves_to_back() {
    let mut m = LinkedMap::new();
    m.insert("x", 1);
    m.insert("y", 2);
    assert_eq!(m.insert("x", 3), Some(1));
    assert_eq!(m.get(&"x"), Some(&3));
    assert_eq!(m.front(), Some((&"y", &2)));
}

#[tokio::test]
async fn test_keyed_executor_preserves_order_per_key() {
    let executor = KeyedExecutor::new(4);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let mut done_tx = Some(done_tx);

    for i in 0..50u32 {
        let seen = seen.clone();
        let tx = if i == 49 { done_tx.take() } else { None };
        executor.submit("k", async move {
            // later tasks would overtake earlier ones without per-key ordering
            if i % 7 == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            seen.lock().push(i);
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        });
    }
    done_rx.await.unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_keyed_executor_runs_keys_concurrently() {
    let executor = KeyedExecutor::new(2);
    let (block_tx, block_rx) = oneshot::channel::<()>();
    let (other_tx, other_rx) = oneshot::channel();

    executor.submit(1u64, async move {
        let _ = block_rx.await;
    });
    executor.submit(2u64, async move {
        let _ = other_tx.send(());
    });

    // key 2 completes while key 1 is still blocked
    tokio::time::timeout(Duration::from_secs(1), other_rx)
        .await
        .expect("key 2 should not wait on key 1")
        .unwrap();
    assert_eq!(executor.active_keys(), 1);
    block_tx.send(()).unwrap();
}
