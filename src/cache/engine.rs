use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::transactions::TxnState;
use super::CacheListener;
use super::CacheStats;
use super::Line;
use super::LineState;
use super::ListenerEvent;
use super::NoopListener;
use super::PendingKind;
use super::StatsSnapshot;
use super::TxnHandle;
use crate::metrics::EXCHANGE_LATENCY_MS;
use crate::metrics::LINES_CACHED;
use crate::utils::async_task::jittered;
use crate::BackupManager;
use crate::CacheConfig;
use crate::Cluster;
use crate::Error;
use crate::GridConfig;
use crate::GridError;
use crate::ImageSource;
use crate::ItemId;
use crate::LinkedMap;
use crate::Message;
use crate::NodeId;
use crate::OwnedImage;
use crate::OwnerDirectory;
use crate::PendingReplies;
use crate::Result;
use crate::RetryPolicies;
use crate::StorageError;
use crate::SystemError;
use crate::Transport;
use crate::SERVER;

/// Attempts at reserving a fresh id range before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Read-only view of a line, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSnapshot {
    pub state: LineState,
    pub deleted: bool,
    pub version: u64,
    pub data: Option<Bytes>,
    pub owner_hint: Option<NodeId>,
    pub sharers: BTreeSet<NodeId>,
    pub pending: Option<PendingKind>,
    pub dirty: bool,
    pub in_transaction: bool,
}

#[derive(Debug, Default)]
pub(super) struct IdRange {
    next: ItemId,
    end: ItemId,
}

/// What a local operation does after looking at its line.
pub(super) enum Step<T> {
    Done(T),
    /// Wait for the running exchange, then look again
    Wait {
        rx: oneshot::Receiver<std::result::Result<(), GridError>>,
        start: Option<PendingKind>,
        joined: Option<PendingKind>,
    },
    /// Line pinned by another transaction
    Busy,
}

/// Cache coherence engine of one grid member.
///
/// Holds the line table and drives every line through the
/// INVALID/SHARED/OWNED protocol. Each line has its own mutex which is never
/// held across an await. Exchanges with other nodes run as spawned tasks
/// that outlive the caller that started them, so a dropped caller never
/// strands the other waiters of a line.
pub struct CacheEngine {
    pub(super) me: NodeId,
    pub(super) config: CacheConfig,
    pub(super) retry: RetryPolicies,
    pub(super) lines: DashMap<ItemId, Arc<Mutex<Line>>>,
    pub(super) lru: Mutex<LinkedMap<ItemId, ()>>,
    pub(super) directory: OwnerDirectory,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) cluster: Arc<dyn Cluster>,
    pub(super) pending: Arc<PendingReplies>,
    pub(super) backup: Arc<BackupManager>,
    pub(super) stats: CacheStats,
    pub(super) listener: RwLock<Arc<dyn CacheListener>>,
    pub(super) txns: Mutex<HashMap<String, TxnState>>,
    pub(super) ids: Mutex<IdRange>,
    pub(super) shutdown: CancellationToken,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("me", &self.me)
            .field("lines", &self.lines.len())
            .finish()
    }
}

impl CacheEngine {
    pub fn new(
        config: &GridConfig,
        directory: OwnerDirectory,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn Cluster>,
        pending: Arc<PendingReplies>,
        backup: Arc<BackupManager>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let me = cluster.node_id();
        Arc::new(Self {
            me,
            config: config.cache.clone(),
            retry: config.retry.clone(),
            lines: DashMap::new(),
            lru: Mutex::new(LinkedMap::new()),
            directory,
            transport,
            cluster,
            pending,
            backup,
            stats: CacheStats::new(me),
            listener: RwLock::new(Arc::new(NoopListener)),
            txns: Mutex::new(HashMap::new()),
            ids: Mutex::new(IdRange::default()),
            shutdown,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.me
    }

    pub fn directory(&self) -> &OwnerDirectory {
        &self.directory
    }

    pub fn backup(&self) -> &Arc<BackupManager> {
        &self.backup
    }

    /// Listener for lines without one of their own.
    pub fn set_listener(
        &self,
        listener: Arc<dyn CacheListener>,
    ) {
        *self.listener.write() = listener;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Counts a reply that reached this node.
    pub(crate) fn count_received(
        &self,
        kind: crate::MessageType,
    ) {
        self.stats.received(kind);
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn snapshot(
        &self,
        id: ItemId,
    ) -> Option<LineSnapshot> {
        self.with_existing(id, |l| LineSnapshot {
            state: l.state,
            deleted: l.deleted,
            version: l.version,
            data: l.data.clone(),
            owner_hint: l.owner_hint,
            sharers: l.sharers.clone(),
            pending: l.pending.as_ref().map(|p| p.kind),
            dirty: l.dirty,
            in_transaction: l.locked_by_txn.is_some(),
        })
    }

    // -
    // Line table

    /// Get-or-allocate: concurrent first accesses share one line.
    fn line(
        &self,
        id: ItemId,
    ) -> Arc<Mutex<Line>> {
        let (line, created) = match self.lines.entry(id) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => (e.insert(Arc::new(Mutex::new(Line::new(id)))).clone(), true),
        };
        self.lru.lock().insert(id, ());
        if created {
            LINES_CACHED.with_label_values(&[&self.me.to_string()]).set(self.lines.len() as i64);
            self.evict_if_needed(id);
        }
        line
    }

    /// Runs `f` on the line of `id` under its lock, allocating the line if needed.
    pub(super) fn with_line<R>(
        &self,
        id: ItemId,
        f: impl FnOnce(&mut Line) -> R,
    ) -> R {
        loop {
            let line = self.line(id);
            let mut guard = line.lock();
            if guard.evicted {
                continue;
            }
            return f(&mut guard);
        }
    }

    /// Runs `f` on the line of `id` if the table holds one.
    pub(super) fn with_existing<R>(
        &self,
        id: ItemId,
        f: impl FnOnce(&mut Line) -> R,
    ) -> Option<R> {
        let line = self.lines.get(&id).map(|e| e.value().clone())?;
        let mut guard = line.lock();
        if guard.evicted {
            return None;
        }
        Some(f(&mut guard))
    }

    /// Handles of every line, collected before any of them is locked.
    pub(super) fn all_lines(&self) -> Vec<Arc<Mutex<Line>>> {
        self.lines.iter().map(|e| e.value().clone()).collect()
    }

    fn evict_if_needed(
        &self,
        keep: ItemId,
    ) {
        let max = self.config.max_lines;
        let mut excess = self.lines.len().saturating_sub(max);
        if excess == 0 {
            return;
        }
        let mut budget = self.lru.lock().len();
        while excess > 0 && budget > 0 {
            budget -= 1;
            let Some((id, ())) = self.lru.lock().pop_front() else {
                break;
            };
            let evicted = if id == keep {
                false
            } else {
                match self.try_evict(id) {
                    Ok(evicted) => evicted,
                    Err(e) => {
                        warn!(id, ?e, "write-back on eviction failed");
                        false
                    }
                }
            };
            if evicted {
                excess -= 1;
            } else {
                self.lru.lock().insert(id, ());
            }
        }
    }

    /// Evicts one line unless it is busy, watched, pinned or shared.
    ///
    /// Owned lines are written back to the store and handed to [`SERVER`].
    fn try_evict(
        &self,
        id: ItemId,
    ) -> Result<bool> {
        let Some(line) = self.lines.get(&id).map(|e| e.value().clone()) else {
            return Ok(true);
        };
        let mut l = line.lock();
        if l.evicted {
            return Ok(true);
        }
        if l.pending.is_some() || l.listener.is_some() || l.locked_by_txn.is_some() || !l.sharers.is_empty()
        {
            return Ok(false);
        }
        if l.is_owned() {
            let data = l.data.clone().unwrap_or_default();
            self.directory.db().write(id, SERVER, l.version, &data, None)?;
            self.backup.record_released(id);
            debug!(id, version = l.version, "owned line written back on eviction");
        }
        l.evicted = true;
        self.lines.remove(&id);
        drop(l);

        self.stats.eviction();
        LINES_CACHED.with_label_values(&[&self.me.to_string()]).set(self.lines.len() as i64);
        self.notify(None, ListenerEvent::Evicted(id));
        Ok(true)
    }

    // -
    // Helpers

    pub(super) fn notify(
        &self,
        listener: Option<Arc<dyn CacheListener>>,
        event: ListenerEvent,
    ) {
        let listener = listener.unwrap_or_else(|| self.listener.read().clone());
        event.dispatch(listener.as_ref());
    }

    pub(super) async fn send(
        &self,
        msg: Message,
    ) -> Result<()> {
        self.stats.sent(msg.kind);
        self.transport.send(msg).await
    }

    fn ensure_master(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(GridError::Shutdown.into());
        }
        if !self.cluster.is_master() {
            return Err(GridError::NotMaster(self.me).into());
        }
        Ok(())
    }

    /// Starts the exchange of `kind` on a spawned task. Its outcome is
    /// handed to every waiter of the line.
    pub(super) fn spawn_exchange(
        self: &Arc<Self>,
        id: ItemId,
        kind: PendingKind,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = match kind {
                PendingKind::Get | PendingKind::GetX | PendingKind::Del => engine.fetch(id, kind).await,
                PendingKind::Inv => engine.invalidate_sharers(id).await,
            };
            let result = result.map_err(|e| e.into_grid_error(id));
            EXCHANGE_LATENCY_MS
                .with_label_values(&[&engine.me.to_string(), kind_label(kind)])
                .observe(started.elapsed().as_secs_f64() * 1000.0);
            if let Err(e) = &result {
                debug!(id, ?kind, %e, "exchange failed");
            }

            let waiters = engine.with_line(id, |l| l.finish_pending());
            for w in waiters {
                // a waiter may have given up
                let _ = w.send(result.clone());
            }
        });
    }

    async fn wait_exchange(
        self: &Arc<Self>,
        id: ItemId,
        rx: oneshot::Receiver<std::result::Result<(), GridError>>,
        start: Option<PendingKind>,
    ) -> Result<()> {
        if let Some(kind) = start {
            self.spawn_exchange(id, kind);
        }
        match rx.await {
            Ok(r) => r.map_err(Error::from),
            Err(_) => Err(GridError::Failed {
                id,
                reason: "exchange task ended without a result".into(),
            }
            .into()),
        }
    }

    async fn busy_backoff(
        &self,
        id: ItemId,
        attempt: &mut u32,
    ) -> Result<()> {
        let policy = self.retry.protocol;
        *attempt += 1;
        if *attempt > policy.max_retries {
            return Err(GridError::Timeout {
                id,
                retries: policy.max_retries,
            }
            .into());
        }
        trace!(id, attempt, "line pinned by a transaction, backing off");
        sleep(jittered(policy, *attempt)).await;
        Ok(())
    }

    // -
    // Local API

    /// Reads `id`, fetching a shared copy when the line holds none.
    pub async fn get(
        self: &Arc<Self>,
        id: ItemId,
    ) -> Result<Bytes> {
        self.ensure_master()?;
        let mut missed = false;
        loop {
            let step = self.with_line(id, |l| {
                if l.deleted {
                    return Step::Done(Err(GridError::RefNotFound(id)));
                }
                if l.is_readable() {
                    return Step::Done(Ok(l.data.clone().unwrap_or_default()));
                }
                wait_step(l, PendingKind::Get)
            });
            match step {
                Step::Done(r) => {
                    if !missed && r.is_ok() {
                        self.stats.hit();
                    }
                    return r.map_err(Error::from);
                }
                Step::Wait { rx, start, .. } => {
                    if !missed {
                        self.stats.miss();
                        missed = true;
                    }
                    self.wait_exchange(id, rx, start).await?;
                }
                // reads never see a pinned line as busy
                Step::Busy => continue,
            }
        }
    }

    /// Acquires exclusive ownership of `id`. Returns the owned version.
    pub async fn getx(
        self: &Arc<Self>,
        id: ItemId,
    ) -> Result<u64> {
        self.ensure_master()?;
        let mut fetched = false;
        loop {
            let step = self.with_line(id, |l| {
                if l.deleted {
                    return Step::Done(Err(GridError::RefNotFound(id)));
                }
                if l.is_settled_owner() {
                    return Step::Done(Ok(l.version));
                }
                wait_step(l, PendingKind::GetX)
            });
            match step {
                Step::Done(r) => {
                    let version = r?;
                    if fetched {
                        self.backup.sync().await?;
                    } else {
                        self.stats.hit();
                    }
                    return Ok(version);
                }
                Step::Wait { rx, start, .. } => {
                    if !fetched {
                        self.stats.miss();
                    }
                    fetched = true;
                    self.wait_exchange(id, rx, start).await?;
                }
                // reads never see a pinned line as busy
                Step::Busy => continue,
            }
        }
    }

    /// Writes `data` to `id` and returns the new version.
    ///
    /// Acquires ownership first and invalidates every sharer before the
    /// write becomes visible. With `txn` the write is pinned to the
    /// transaction until commit or abort.
    ///
    /// In sync replication mode [`GridError::NotReplicated`] reports a write
    /// that is applied here but not yet acknowledged by enough slaves.
    pub async fn set(
        self: &Arc<Self>,
        id: ItemId,
        data: Bytes,
        txn: Option<&TxnHandle>,
    ) -> Result<u64> {
        let mut busy = 0;
        loop {
            self.getx(id).await?;
            let step = self.with_line(id, |l| {
                if !l.is_settled_owner() {
                    return Step::Done(None);
                }
                if !self.may_touch(l, txn) {
                    return Step::Busy;
                }
                if !l.sharers.is_empty() {
                    return wait_step(l, PendingKind::Inv);
                }
                if let Some(t) = txn {
                    if let Err(e) = self.capture_pre_image(t, l) {
                        return Step::Done(Some(Err(e)));
                    }
                    l.locked_by_txn = Some(t.id().to_string());
                }
                let version = l.write(data.clone());
                if let Some(v) = version {
                    self.backup.record_owned(id, v, &data);
                }
                Step::Done(version.map(Ok))
            });
            match step {
                Step::Done(Some(r)) => {
                    let version = r?;
                    trace!(id, version, "line written");
                    self.backup.sync().await?;
                    return Ok(version);
                }
                // ownership moved away between getx and the write
                Step::Done(None) => continue,
                Step::Wait { rx, start, .. } => self.wait_exchange(id, rx, start).await?,
                Step::Busy => self.busy_backoff(id, &mut busy).await?,
            }
        }
    }

    /// Creates a new item owned by this node and returns its id.
    pub async fn put(
        self: &Arc<Self>,
        data: Bytes,
    ) -> Result<ItemId> {
        self.ensure_master()?;
        let id = self.next_id()?;
        let version = self.with_line(id, |l| {
            l.install_owned(1, data.clone());
            l.dirty = true;
            l.version
        });
        self.backup.record_owned(id, version, &data);
        self.backup.sync().await?;
        debug!(id, "item created");
        Ok(id)
    }

    fn next_id(&self) -> Result<ItemId> {
        let mut ids = self.ids.lock();
        if ids.next >= ids.end {
            let count = self.config.id_allocation_batch;
            let mut reserved = false;
            for _ in 0..MAX_ALLOCATION_ATTEMPTS {
                let start = self.directory.db().max_id()? + 1;
                match self.directory.allocate(self.me, start, count) {
                    Ok(()) => {
                        debug!(start, count, "id range reserved");
                        ids.next = start;
                        ids.end = start + count;
                        reserved = true;
                        break;
                    }
                    Err(Error::System(SystemError::Storage(StorageError::AllocationOverlap { .. }))) => {
                        trace!(start, "id range taken, retrying");
                    }
                    Err(e) => return Err(e),
                }
            }
            if !reserved {
                return Err(Error::Fatal("could not reserve an id range".into()));
            }
        }
        let id = ids.next;
        ids.next += 1;
        Ok(id)
    }

    /// Deletes `id` cluster-wide.
    ///
    /// Without a transaction a remote owner is asked with DEL; with one, the
    /// line is acquired and the delete waits for commit.
    pub async fn del(
        self: &Arc<Self>,
        id: ItemId,
        txn: Option<&TxnHandle>,
    ) -> Result<()> {
        self.ensure_master()?;
        if txn.is_some() {
            self.getx(id).await?;
        }
        let mut busy = 0;
        loop {
            let step = self.with_line(id, |l| {
                if l.deleted {
                    return Step::Done(Err(Error::from(GridError::RefNotFound(id))));
                }
                if !l.is_settled_owner() {
                    if txn.is_some() {
                        return Step::Done(Ok(false));
                    }
                    return wait_step(l, PendingKind::Del);
                }
                if !self.may_touch(l, txn) {
                    return Step::Busy;
                }
                if !l.sharers.is_empty() {
                    return wait_step(l, PendingKind::Inv);
                }
                match txn {
                    Some(t) => {
                        if let Err(e) = self.capture_pre_image(t, l) {
                            return Step::Done(Err(e));
                        }
                        l.locked_by_txn = Some(t.id().to_string());
                        l.deleted = true;
                        l.data = None;
                        Step::Done(Ok(true))
                    }
                    None => Step::Done(self.delete_owned_locked(l).map(|_| true)),
                }
            });
            match step {
                Step::Done(Ok(true)) => {
                    self.backup.sync().await?;
                    return Ok(());
                }
                // lost ownership while in a transaction
                Step::Done(Ok(false)) => {
                    self.getx(id).await?;
                }
                Step::Done(Err(e)) => return Err(e),
                Step::Wait { rx, start, joined } => {
                    self.wait_exchange(id, rx, start).await?;
                    if start == Some(PendingKind::Del) || joined == Some(PendingKind::Del) {
                        return Ok(());
                    }
                }
                Step::Busy => self.busy_backoff(id, &mut busy).await?,
            }
        }
    }

    /// Removes an owned line from the store and marks it deleted.
    pub(super) fn delete_owned_locked(
        &self,
        l: &mut Line,
    ) -> Result<()> {
        self.directory.db().delete(l.id, None)?;
        l.mark_deleted();
        self.backup.record_deleted(l.id);
        debug!(id = l.id, "item deleted");
        Ok(())
    }

    /// Gives up the local copy of `id`. An owned line is written back to
    /// the store first and handed to [`SERVER`].
    pub async fn release(
        self: &Arc<Self>,
        id: ItemId,
    ) -> Result<()> {
        let mut busy = 0;
        loop {
            let step = self.with_line(id, |l| {
                if l.deleted {
                    return Step::Done(Ok(None));
                }
                if l.pending.is_some() {
                    return wait_step(l, PendingKind::Inv);
                }
                match l.state {
                    LineState::Invalid => Step::Done(Ok(None)),
                    LineState::Shared => {
                        l.state = LineState::Invalid;
                        l.data = None;
                        Step::Done(Ok(None))
                    }
                    LineState::Owned => {
                        if l.locked_by_txn.is_some() {
                            return Step::Busy;
                        }
                        if !l.sharers.is_empty() {
                            return wait_step(l, PendingKind::Inv);
                        }
                        let data = l.data.take().unwrap_or_default();
                        if let Err(e) = self.directory.db().write(id, SERVER, l.version, &data, None) {
                            l.data = Some(data);
                            return Step::Done(Err(e));
                        }
                        l.state = LineState::Invalid;
                        l.owner_hint = None;
                        l.dirty = false;
                        self.backup.record_released(id);
                        Step::Done(Ok(Some(l.version)))
                    }
                }
            });
            match step {
                Step::Done(r) => {
                    if let Some(version) = r? {
                        debug!(id, version, "owned line released to the store");
                        self.backup.sync().await?;
                    }
                    return Ok(());
                }
                Step::Wait { rx, start, .. } => self.wait_exchange(id, rx, start).await?,
                Step::Busy => self.busy_backoff(id, &mut busy).await?,
            }
        }
    }

    /// Drops a shared copy without telling anyone. Owned lines are untouched.
    pub fn invalidate_local(
        &self,
        id: ItemId,
    ) -> bool {
        let changed = self.with_existing(id, |l| {
            if l.state == LineState::Shared && l.pending.is_none() {
                l.state = LineState::Invalid;
                l.data = None;
                Some(l.listener.clone())
            } else {
                None
            }
        });
        match changed.flatten() {
            Some(listener) => {
                self.stats.invalidation();
                self.notify(listener, ListenerEvent::Invalidated(id));
                true
            }
            None => false,
        }
    }

    /// Registers `listener` for events of `id`.
    pub fn listen(
        &self,
        id: ItemId,
        listener: Arc<dyn CacheListener>,
    ) {
        self.with_line(id, |l| l.listener = Some(listener));
    }

    // -
    // Membership

    /// A node group left without a successor: its owner records go back
    /// to the store and lines pointing at it are reported killed.
    pub fn on_node_removed(
        &self,
        node: NodeId,
    ) -> Result<()> {
        let released = self.directory.remove_owner(node)?;
        let mut killed = Vec::new();
        for line in self.all_lines() {
            let mut l = line.lock();
            if l.evicted {
                continue;
            }
            l.sharers.remove(&node);
            if l.owner_hint == Some(node) {
                l.owner_hint = None;
                if !l.is_owned() && !l.deleted {
                    l.state = LineState::Invalid;
                    l.data = None;
                    killed.push((l.id, l.listener.clone()));
                }
            }
        }
        warn!(node, released, killed = killed.len(), "node removed");
        for (id, listener) in killed {
            self.notify(listener, ListenerEvent::Killed(id));
        }
        Ok(())
    }

    /// Images of every owned line, for a full backup sync.
    pub fn owned_lines(&self) -> Vec<OwnedImage> {
        let mut out: Vec<OwnedImage> = self
            .all_lines()
            .into_iter()
            .filter_map(|line| {
                let l = line.lock();
                (l.is_owned() && !l.evicted).then(|| (l.id, l.version, l.data.clone().unwrap_or_default()))
            })
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    /// Owned-line images for the backup manager, without keeping the engine alive.
    pub fn image_source(self: &Arc<Self>) -> ImageSource {
        let engine = Arc::downgrade(self);
        Arc::new(move || engine.upgrade().map(|e| e.owned_lines()).unwrap_or_default())
    }

    /// Installs promoted backup images as owned lines.
    ///
    /// The shared copies handed out by the previous master are unknown, so
    /// every other node counts as a sharer until the first write.
    pub fn install_owned(
        &self,
        images: Vec<OwnedImage>,
    ) -> usize {
        let count = images.len();
        let others: BTreeSet<NodeId> = self.cluster.nodes().into_iter().filter(|n| *n != self.me).collect();
        for (id, version, data) in images {
            self.with_line(id, |l| {
                l.install_owned(version, data);
                l.sharers = others.clone();
                l.dirty = true;
            });
        }
        count
    }

    /// Another member took over as master of `node`. Copies it handed out
    /// carry versions of the previous master and are dropped.
    pub fn on_node_switched(
        &self,
        node: NodeId,
    ) {
        let mut dropped = Vec::new();
        for line in self.all_lines() {
            let mut l = line.lock();
            if l.evicted || l.deleted || l.is_owned() || l.pending.is_some() || l.owner_hint != Some(node) {
                continue;
            }
            let was_shared = l.state == LineState::Shared;
            l.state = LineState::Invalid;
            l.data = None;
            // versions of the new master are not comparable with these
            l.version = 0;
            l.last_inv = None;
            l.missed_inv = None;
            if was_shared {
                dropped.push((l.id, l.listener.clone()));
            }
        }
        info!(node, dropped = dropped.len(), "node group switched master");
        for (id, listener) in dropped {
            self.notify(listener, ListenerEvent::Invalidated(id));
        }
    }

    /// Whether `id` is owned here, or where a message for it should go instead.
    pub fn route_message(
        &self,
        id: ItemId,
    ) -> Result<MessageRoute> {
        let local = self.with_existing(id, |l| {
            if l.deleted {
                Some(MessageRoute::NotFound)
            } else if l.is_owned() {
                Some(MessageRoute::Local(l.listener.clone()))
            } else {
                l.owner_hint.map(MessageRoute::Redirect)
            }
        });
        if let Some(Some(route)) = local {
            return Ok(route);
        }
        Ok(match self.directory.owner_of(id)? {
            Some(owner) if owner == self.me => MessageRoute::Local(None),
            Some(owner) => MessageRoute::Redirect(owner),
            None => MessageRoute::NotFound,
        })
    }

    fn may_touch(
        &self,
        l: &Line,
        txn: Option<&TxnHandle>,
    ) -> bool {
        match (&l.locked_by_txn, txn) {
            (None, _) => true,
            (Some(holder), Some(t)) => holder == t.id(),
            (Some(_), None) => false,
        }
    }
}

/// Where a messenger payload for an item goes.
#[derive(Clone)]
pub enum MessageRoute {
    /// Owned here; deliver to the line listener if any
    Local(Option<Arc<dyn CacheListener>>),
    Redirect(NodeId),
    NotFound,
}

impl std::fmt::Debug for MessageRoute {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            MessageRoute::Local(l) => write!(f, "Local(listener: {})", l.is_some()),
            MessageRoute::Redirect(n) => write!(f, "Redirect({n})"),
            MessageRoute::NotFound => f.write_str("NotFound"),
        }
    }
}

fn wait_step<T>(
    l: &mut Line,
    kind: PendingKind,
) -> Step<T> {
    let joined = l.pending.as_ref().map(|p| p.kind);
    let (rx, start) = l.join_or_start(kind);
    Step::Wait {
        rx,
        start: start.then_some(kind),
        joined,
    }
}

fn kind_label(kind: PendingKind) -> &'static str {
    match kind {
        PendingKind::Get => "get",
        PendingKind::GetX => "getx",
        PendingKind::Del => "del",
        PendingKind::Inv => "inv",
    }
}
