use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::trace;

use super::Message;
use crate::MemberId;
use crate::NodeId;

/// First request seq of a member incarnation. Member ids are not reused
/// within a node group, so a promoted member never repeats the seqs its
/// predecessor sent under the same node id.
pub fn seq_base(member: MemberId) -> u64 {
    u64::from(member) << 48
}

struct Waiting {
    request: Message,
    tx: oneshot::Sender<Message>,
}

/// In-flight requests waiting for their reply.
///
/// Entries are bucketed by `(destination, seq)` and matched with
/// [`Message::is_response_to`], so several identical requests (one backup
/// packet sent to every slave of a group) are completed one reply at a time.
pub struct PendingReplies {
    next_seq: AtomicU64,
    table: Mutex<HashMap<(NodeId, u64), Vec<Waiting>>>,
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::with_seq_base(0)
    }

    /// Request seqs start right after `base`.
    pub fn with_seq_base(base: u64) -> Self {
        Self {
            next_seq: AtomicU64::new(base + 1),
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(
        &self,
        request: &Message,
    ) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.table
            .lock()
            .entry((request.to, request.seq))
            .or_default()
            .push(Waiting {
                request: request.clone(),
                tx,
            });
        rx
    }

    /// Hands `reply` to the first request it answers.
    ///
    /// Returns false when nothing matched (late or duplicate reply).
    pub fn complete(
        &self,
        reply: Message,
    ) -> bool {
        let waiting = {
            let mut table = self.table.lock();
            let key = (reply.from, reply.seq);
            let Some(bucket) = table.get_mut(&key) else {
                return false;
            };
            let Some(pos) = bucket.iter().position(|w| reply.is_response_to(&w.request)) else {
                return false;
            };
            let waiting = bucket.remove(pos);
            if bucket.is_empty() {
                table.remove(&key);
            }
            waiting
        };
        trace!(%reply, "reply matched");
        // receiver gone means the caller gave up; the reply is simply dropped
        waiting.tx.send(reply).is_ok()
    }

    /// Drops one waiting entry equal to `request`.
    pub fn remove(
        &self,
        request: &Message,
    ) -> bool {
        let mut table = self.table.lock();
        let key = (request.to, request.seq);
        let Some(bucket) = table.get_mut(&key) else {
            return false;
        };
        let removed = match bucket.iter().position(|w| w.request == *request) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        };
        if bucket.is_empty() {
            table.remove(&key);
        }
        removed
    }

    /// Waits for the reply of a registered `request`, removing it on timeout.
    pub async fn wait(
        &self,
        request: &Message,
        rx: oneshot::Receiver<Message>,
        deadline: Duration,
    ) -> Option<Message> {
        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.remove(request);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
