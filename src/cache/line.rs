use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::CacheListener;
use crate::GridError;
use crate::ItemId;
use crate::NodeId;

/// Coherence state of a line. Ordered `Invalid < Shared < Owned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LineState {
    Invalid,
    Shared,
    Owned,
}

impl LineState {
    pub fn is_less_than(
        self,
        other: LineState,
    ) -> bool {
        self < other
    }
}

/// Kind of protocol exchange a line is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Get,
    GetX,
    Del,
    /// Owner invalidating its sharers before a write, delete or release
    Inv,
}

pub(crate) type Waiter = oneshot::Sender<Result<(), GridError>>;

/// In-flight exchange of a line. Local callers arriving while it runs join
/// `waiters` and re-evaluate the line once it resolves.
#[derive(Debug)]
pub struct PendingOp {
    pub kind: PendingKind,
    pub(crate) waiters: Vec<Waiter>,
}

impl PendingOp {
    pub(crate) fn new(kind: PendingKind) -> Self {
        Self {
            kind,
            waiters: Vec::new(),
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

pub struct Line {
    pub id: ItemId,
    pub state: LineState,
    /// Terminal: the item was deleted cluster-wide
    pub deleted: bool,
    pub version: u64,
    pub data: Option<Bytes>,
    pub owner_hint: Option<NodeId>,
    /// Nodes holding a shared copy. Only tracked while owned.
    pub sharers: BTreeSet<NodeId>,
    pub pending: Option<PendingOp>,
    pub listener: Option<Arc<dyn CacheListener>>,
    /// Owned contents newer than the store
    pub dirty: bool,
    /// Transaction holding uncommitted writes on this line
    pub locked_by_txn: Option<String>,
    /// Last invalidation handled, as `(from, seq)`
    pub(crate) last_inv: Option<(NodeId, u64)>,
    /// Removed from the line table; holders of a stale handle must look it up again
    pub(crate) evicted: bool,
    /// Version of an INV that arrived while a GET was in flight
    pub(crate) missed_inv: Option<u64>,
}

impl std::fmt::Debug for Line {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("deleted", &self.deleted)
            .field("version", &self.version)
            .field("owner_hint", &self.owner_hint)
            .field("sharers", &self.sharers)
            .field("pending", &self.pending.as_ref().map(|p| p.kind))
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Line {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            state: LineState::Invalid,
            deleted: false,
            version: 0,
            data: None,
            owner_hint: None,
            sharers: BTreeSet::new(),
            pending: None,
            listener: None,
            dirty: false,
            locked_by_txn: None,
            last_inv: None,
            evicted: false,
            missed_inv: None,
        }
    }

    /// A message about `version` is older than what the line already saw.
    pub fn is_stale(
        &self,
        version: u64,
    ) -> bool {
        version < self.version
    }

    pub fn is_owned(&self) -> bool {
        self.state == LineState::Owned && !self.deleted
    }

    /// Readable without any exchange.
    pub fn is_readable(&self) -> bool {
        !self.deleted && self.state >= LineState::Shared && self.data.is_some()
    }

    /// Line can answer requests and take local writes right now.
    pub fn is_settled_owner(&self) -> bool {
        self.is_owned() && self.pending.is_none()
    }

    /// Shared copy granted by `from`. Returns false if the grant is stale.
    pub fn apply_put(
        &mut self,
        from: NodeId,
        version: u64,
        data: Bytes,
    ) -> bool {
        if self.is_stale(version) || self.state == LineState::Owned {
            return false;
        }
        // the grant was overtaken by an invalidation of the same copy
        if self.missed_inv.take().is_some_and(|v| version <= v) {
            return false;
        }
        self.state = LineState::Shared;
        self.version = version;
        self.data = Some(data);
        self.owner_hint = Some(from);
        true
    }

    /// Takes ownership at `version`.
    pub fn install_owned(
        &mut self,
        version: u64,
        data: Bytes,
    ) {
        self.state = LineState::Owned;
        self.deleted = false;
        self.version = self.version.max(version);
        self.data = Some(data);
        self.owner_hint = None;
        self.sharers.clear();
        self.dirty = false;
    }

    /// Gives ownership to `to`: the line becomes invalid and the returned
    /// sharers (minus `to`) are the ones the new owner must invalidate.
    pub fn handoff(
        &mut self,
        to: NodeId,
    ) -> (u64, Bytes, Vec<NodeId>) {
        let sharers = std::mem::take(&mut self.sharers)
            .into_iter()
            .filter(|n| *n != to)
            .collect();
        let data = self.data.take().unwrap_or_default();
        self.state = LineState::Invalid;
        self.owner_hint = Some(to);
        self.dirty = false;
        (self.version, data, sharers)
    }

    /// Drops a shared copy on request of owner `from`.
    ///
    /// Returns true when the line actually changed state.
    pub fn invalidate(
        &mut self,
        from: NodeId,
        version: u64,
    ) -> bool {
        if self.state != LineState::Shared || self.is_stale(version) {
            if self.pending.as_ref().is_some_and(|p| p.kind == PendingKind::Get) {
                self.missed_inv = Some(version);
            }
            return false;
        }
        self.state = LineState::Invalid;
        self.data = None;
        self.owner_hint = Some(from);
        true
    }

    /// Local write on an owned line. Returns the new version.
    pub fn write(
        &mut self,
        data: Bytes,
    ) -> Option<u64> {
        if !self.is_owned() {
            return None;
        }
        self.version += 1;
        self.data = Some(data);
        self.dirty = true;
        Some(self.version)
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.state = LineState::Invalid;
        self.data = None;
        self.sharers.clear();
        self.dirty = false;
        self.owner_hint = None;
    }

    /// Joins the running exchange or starts a new one of `kind`.
    ///
    /// Returns the receiver to wait on and whether the caller must start
    /// the exchange.
    pub(crate) fn join_or_start(
        &mut self,
        kind: PendingKind,
    ) -> (oneshot::Receiver<Result<(), GridError>>, bool) {
        let (tx, rx) = oneshot::channel();
        match self.pending.as_mut() {
            Some(p) => {
                p.waiters.push(tx);
                (rx, false)
            }
            None => {
                let mut op = PendingOp::new(kind);
                op.waiters.push(tx);
                self.pending = Some(op);
                (rx, true)
            }
        }
    }

    /// Clears the pending exchange and hands back its waiters.
    pub(crate) fn finish_pending(&mut self) -> Vec<Waiter> {
        self.missed_inv = None;
        self.pending.take().map(|p| p.waiters).unwrap_or_default()
    }
}
