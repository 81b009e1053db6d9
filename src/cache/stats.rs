use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::message::MESSAGE_TYPE_COUNT;
use crate::metrics::CACHE_EVENTS;
use crate::metrics::MESSAGES_RECEIVED;
use crate::metrics::MESSAGES_SENT;
use crate::MessageType;
use crate::NodeId;

/// Line table counters of one member, mirrored into prometheus.
pub struct CacheStats {
    node: String,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    invalidations: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
    sent: [AtomicU64; MESSAGE_TYPE_COUNT],
    received: [AtomicU64; MESSAGE_TYPE_COUNT],
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Replies and invalidations discarded as older than the line
    pub stale: u64,
    pub invalidations: u64,
    pub timeouts: u64,
    pub evictions: u64,
    pub sent: Vec<(MessageType, u64)>,
    pub received: Vec<(MessageType, u64)>,
}

impl StatsSnapshot {
    pub fn sent_of(
        &self,
        kind: MessageType,
    ) -> u64 {
        self.sent.iter().find(|(k, _)| *k == kind).map_or(0, |(_, n)| *n)
    }

    pub fn received_of(
        &self,
        kind: MessageType,
    ) -> u64 {
        self.received.iter().find(|(k, _)| *k == kind).map_or(0, |(_, n)| *n)
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.iter().map(|(_, n)| n).sum()
    }
}

impl CacheStats {
    pub fn new(node: NodeId) -> Self {
        Self {
            node: node.to_string(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sent: std::array::from_fn(|_| AtomicU64::new(0)),
            received: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn bump(
        &self,
        counter: &AtomicU64,
        event: &str,
    ) {
        counter.fetch_add(1, Ordering::Relaxed);
        CACHE_EVENTS.with_label_values(&[&self.node, event]).inc();
    }

    pub fn hit(&self) {
        self.bump(&self.hits, "hit");
    }

    pub fn miss(&self) {
        self.bump(&self.misses, "miss");
    }

    pub fn stale(&self) {
        self.bump(&self.stale, "stale");
    }

    pub fn invalidation(&self) {
        self.bump(&self.invalidations, "invalidation");
    }

    pub fn timeout(&self) {
        self.bump(&self.timeouts, "timeout");
    }

    pub fn eviction(&self) {
        self.bump(&self.evictions, "eviction");
    }

    pub fn sent(
        &self,
        kind: MessageType,
    ) {
        self.sent[kind as usize].fetch_add(1, Ordering::Relaxed);
        MESSAGES_SENT.with_label_values(&[&self.node, kind.as_str()]).inc();
    }

    pub fn received(
        &self,
        kind: MessageType,
    ) {
        self.received[kind as usize].fetch_add(1, Ordering::Relaxed);
        MESSAGES_RECEIVED.with_label_values(&[&self.node, kind.as_str()]).inc();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let per_type = |counters: &[AtomicU64; MESSAGE_TYPE_COUNT]| {
            MessageType::ALL
                .iter()
                .map(|k| (*k, counters[*k as usize].load(Ordering::Relaxed)))
                .filter(|(_, n)| *n > 0)
                .collect()
        };
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            sent: per_type(&self.sent),
            received: per_type(&self.received),
        }
    }
}
