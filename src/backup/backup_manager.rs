use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::BackupPacket;
use super::BackupRecord;
use crate::metrics::BACKUP_BATCH_SIZE;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::BackupConfig;
use crate::Cluster;
use crate::GridError;
use crate::ItemId;
use crate::MemberId;
use crate::Message;
use crate::MessageType;
use crate::NetworkError;
use crate::NodeId;
use crate::PendingReplies;
use crate::ProtocolError;
use crate::ReplicationMode;
use crate::Result;
use crate::Transport;

/// Owned line image `(id, version, data)`.
pub type OwnedImage = (ItemId, u64, Bytes);

/// Produces the image of every owned line, for slaves that need a full copy.
pub type ImageSource = Arc<dyn Fn() -> Vec<OwnedImage> + Send + Sync>;

/// What the master knows about one of its slaves.
#[derive(Debug)]
struct SlaveLink {
    /// Seq of the last packet sent to it
    seq: u64,
    /// Records it has not acknowledged yet, latest wins
    unacked: BTreeMap<ItemId, BackupRecord>,
    /// Next packet has to be a full image
    needs_image: bool,
}

impl SlaveLink {
    fn new() -> Self {
        Self {
            seq: 0,
            unacked: BTreeMap::new(),
            needs_image: true,
        }
    }

    fn caught_up(&self) -> bool {
        !self.needs_image && self.unacked.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOutcome {
    Acked,
    /// The slave cannot apply deltas and wants a full image
    Resync,
    Lost,
}

#[derive(Debug, Default)]
struct SlaveState {
    /// Master member whose packets build the shadow table
    source: Option<MemberId>,
    /// Highest packet seq applied from `source`
    applied: u64,
    shadow: BTreeMap<ItemId, (u64, Bytes)>,
}

impl SlaveState {
    fn apply(
        &mut self,
        records: Vec<BackupRecord>,
    ) {
        for record in records {
            match record {
                BackupRecord::Owned { id, version, data } => {
                    self.shadow.insert(id, (version, Bytes::from(data)));
                }
                BackupRecord::Released { id } | BackupRecord::Deleted { id } => {
                    self.shadow.remove(&id);
                }
            }
        }
    }
}

/// Replicates owned-line mutations of a master to the slaves of its node
/// group, and keeps the shadow table on a slave.
///
/// Records are batched latest-wins per item. Every flush hands the batch to
/// each slave's link and sends the link's unacknowledged records as one
/// packet, so a lost packet or ack is repaired by the next one. A slave
/// that joined late, or that answers a delta with NACK because it follows
/// another master, gets a full image first.
///
/// In [`ReplicationMode::Async`] a background loop flushes every
/// `flush_interval_ms`, so a master failure can lose at most one interval
/// of mutations. In [`ReplicationMode::Sync`] callers of [`sync`](Self::sync)
/// wait until enough slaves are caught up.
pub struct BackupManager {
    me: NodeId,
    member: MemberId,
    config: BackupConfig,
    transport: Arc<dyn Transport>,
    cluster: Arc<dyn Cluster>,
    pending: Arc<PendingReplies>,
    batch: Mutex<BTreeMap<ItemId, BackupRecord>>,
    // one flush at a time; links only change under it
    flush_lock: tokio::sync::Mutex<()>,
    links: Mutex<HashMap<MemberId, SlaveLink>>,
    image: RwLock<Option<ImageSource>>,
    slave: Mutex<SlaveState>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("me", &self.me)
            .field("member", &self.member)
            .field("mode", &self.config.mode)
            .field("batched", &self.batch.lock().len())
            .field("slaves", &self.links.lock().len())
            .finish()
    }
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn Cluster>,
        pending: Arc<PendingReplies>,
    ) -> Self {
        Self {
            me: cluster.node_id(),
            member: cluster.member_id(),
            config,
            transport,
            cluster,
            pending,
            batch: Mutex::new(BTreeMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            links: Mutex::new(HashMap::new()),
            image: RwLock::new(None),
            slave: Mutex::new(SlaveState::default()),
        }
    }

    pub fn mode(&self) -> ReplicationMode {
        self.config.mode
    }

    /// Sets where full images come from. Without one, a full packet only
    /// carries the records not yet acknowledged.
    pub fn set_image_source(
        &self,
        source: ImageSource,
    ) {
        *self.image.write() = Some(source);
    }

    fn record(
        &self,
        record: BackupRecord,
    ) {
        if !self.cluster.is_master() {
            return;
        }
        trace!(?record, "backup record");
        self.batch.lock().insert(record.id(), record);
    }

    pub fn record_owned(
        &self,
        id: ItemId,
        version: u64,
        data: &Bytes,
    ) {
        self.record(BackupRecord::Owned {
            id,
            version,
            data: data.to_vec(),
        });
    }

    pub fn record_released(
        &self,
        id: ItemId,
    ) {
        self.record(BackupRecord::Released { id });
    }

    pub fn record_deleted(
        &self,
        id: ItemId,
    ) {
        self.record(BackupRecord::Deleted { id });
    }

    /// Records waiting for the next flush.
    pub fn batched(&self) -> usize {
        self.batch.lock().len()
    }

    /// Records `member` has not acknowledged yet.
    pub fn unacked(
        &self,
        member: MemberId,
    ) -> usize {
        self.links.lock().get(&member).map_or(0, |l| l.unacked.len())
    }

    /// In sync mode, flushes and waits until the configured number of
    /// slaves acknowledged everything recorded so far. A no-op in async mode.
    ///
    /// [`GridError::NotReplicated`] means the changes stay applied locally
    /// and queued for the slaves that missed them.
    pub async fn sync(&self) -> Result<()> {
        match self.config.mode {
            ReplicationMode::Async => Ok(()),
            ReplicationMode::Sync => self.flush_with(self.config.replication_factor).await,
        }
    }

    /// Sends the pending batch without requiring acknowledgements.
    pub async fn flush(&self) -> Result<()> {
        self.flush_with(0).await
    }

    async fn flush_with(
        &self,
        needed: usize,
    ) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked(needed).await
    }

    async fn flush_locked(
        &self,
        needed: usize,
    ) -> Result<()> {
        let batch = std::mem::take(&mut *self.batch.lock());
        let slaves = if self.cluster.is_master() {
            self.cluster.slaves()
        } else {
            Vec::new()
        };
        if slaves.is_empty() {
            self.links.lock().clear();
            if !batch.is_empty() {
                trace!(count = batch.len(), "no slaves, backup batch dropped");
            }
            return Ok(());
        }
        if !batch.is_empty() {
            BACKUP_BATCH_SIZE
                .with_label_values(&[&self.me.to_string()])
                .observe(batch.len() as f64);
        }
        {
            let mut links = self.links.lock();
            links.retain(|m, _| slaves.contains(m));
            for member in &slaves {
                links.entry(*member).or_insert_with(SlaveLink::new);
            }
            for link in links.values_mut() {
                link.unacked.extend(batch.iter().map(|(id, r)| (*id, r.clone())));
            }
        }

        // a slave asking for an image gets it in the same flush
        for _ in 0..2 {
            if !self.send_round().await? {
                break;
            }
        }

        let caught_up = self.links.lock().values().filter(|l| l.caught_up()).count();
        let needed = needed.min(slaves.len());
        if caught_up < needed {
            warn!(caught_up, needed, "backup not acknowledged by enough slaves");
            return Err(GridError::NotReplicated {
                acked: caught_up,
                needed,
            }
            .into());
        }
        Ok(())
    }

    /// Sends one packet to every slave with something outstanding. Returns
    /// true when a slave asked for a full image.
    async fn send_round(&self) -> Result<bool> {
        let wants_image = self.links.lock().values().any(|l| l.needs_image);
        // taken outside the links lock: it locks every line
        let image: Option<BTreeMap<ItemId, BackupRecord>> = if wants_image {
            let source = self.image.read().clone();
            source.map(|source| {
                source()
                    .into_iter()
                    .map(|(id, version, data)| {
                        (
                            id,
                            BackupRecord::Owned {
                                id,
                                version,
                                data: data.to_vec(),
                            },
                        )
                    })
                    .collect()
            })
        } else {
            None
        };

        let mut outgoing = Vec::new();
        {
            let mut links = self.links.lock();
            for (member, link) in links.iter_mut() {
                let full = link.needs_image;
                if full {
                    // the image is newer than anything batched before it
                    if let Some(image) = &image {
                        link.unacked = image.clone();
                    }
                } else if link.unacked.is_empty() {
                    continue;
                }
                link.seq += 1;
                let payload = BackupPacket {
                    source: self.member,
                    seq: link.seq,
                    full,
                    records: link.unacked.values().cloned().collect(),
                }
                .encode()?;
                if full {
                    info!(member, seq = link.seq, count = link.unacked.len(), "full sync to slave");
                }
                outgoing.push((*member, link.seq, payload));
            }
        }
        if outgoing.is_empty() {
            return Ok(false);
        }

        let results = join_all(outgoing.into_iter().map(|(member, seq, payload)| async move {
            (member, seq, self.send_to_slave(member, seq, payload).await)
        }))
        .await;

        let mut resync = false;
        let mut links = self.links.lock();
        for (member, seq, outcome) in results {
            let Some(link) = links.get_mut(&member) else {
                continue;
            };
            match outcome {
                AckOutcome::Acked => {
                    link.unacked.clear();
                    link.needs_image = false;
                    debug!(member, seq, "backup packet acknowledged");
                }
                AckOutcome::Resync => {
                    info!(member, seq, "slave asked for a full image");
                    link.needs_image = true;
                    resync = true;
                }
                // everything stays queued for the next packet
                AckOutcome::Lost => {}
            }
        }
        Ok(resync)
    }

    /// Makes `member` receive a full image of the owned lines and waits for it.
    #[instrument(skip(self))]
    pub async fn full_sync(
        &self,
        member: MemberId,
    ) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        self.links.lock().entry(member).or_insert_with(SlaveLink::new).needs_image = true;
        self.flush_locked(0).await?;
        if self.links.lock().get(&member).is_some_and(SlaveLink::caught_up) {
            Ok(())
        } else {
            Err(GridError::NotReplicated { acked: 0, needed: 1 }.into())
        }
    }

    async fn send_to_slave(
        &self,
        member: MemberId,
        packet_seq: u64,
        payload: Bytes,
    ) -> AckOutcome {
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let policy = BackoffPolicy {
            max_retries: 2,
            timeout_ms: self.config.ack_timeout_ms * 2,
            base_delay_ms: 5,
            max_delay_ms: self.config.ack_timeout_ms,
        };
        let result = task_with_timeout_and_exponential_backoff(
            || {
                let payload = payload.clone();
                async move {
                    let msg = Message::new(MessageType::Backup, self.me, self.me)
                        .with_seq(self.pending.next_seq())
                        .with_version(packet_seq)
                        .with_data(payload);
                    let rx = self.pending.register(&msg);
                    if let Err(e) = self.transport.send_to_member(member, msg.clone()).await {
                        self.pending.remove(&msg);
                        return Err(e);
                    }
                    match self.pending.wait(&msg, rx, ack_timeout).await {
                        Some(reply) => Ok(reply.kind),
                        None => Err(NetworkError::AttemptTimeout(self.config.ack_timeout_ms).into()),
                    }
                }
            },
            policy,
        )
        .await;

        match result {
            Ok(MessageType::Nack) => AckOutcome::Resync,
            Ok(_) => AckOutcome::Acked,
            Err(e) => {
                error!(member, packet_seq, ?e, "slave did not acknowledge backup packet");
                AckOutcome::Lost
            }
        }
    }

    /// Slave side: applies a BACKUP message and returns the answer.
    ///
    /// A delta from a master this slave has no image of is answered with
    /// NACK, asking for a full image. Stale packets are acknowledged and
    /// ignored.
    pub fn handle_packet(
        &self,
        msg: &Message,
    ) -> std::result::Result<Message, ProtocolError> {
        let data = msg.data.as_ref().ok_or(ProtocolError::BadPacket("empty backup message".into()))?;
        let packet = BackupPacket::decode(data)?;

        let mut slave = self.slave.lock();
        let known_source = slave.source == Some(packet.source);
        if known_source && packet.seq <= slave.applied {
            debug!(seq = packet.seq, applied = slave.applied, "stale backup packet");
            return Ok(msg.reply(MessageType::BackupAck));
        }
        if packet.full {
            slave.shadow.clear();
            slave.source = Some(packet.source);
        } else if !known_source {
            debug!(source = packet.source, seq = packet.seq, "delta without an image, asking for one");
            return Ok(msg.reply(MessageType::Nack));
        }
        slave.applied = packet.seq;
        slave.apply(packet.records);
        trace!(applied = slave.applied, shadow = slave.shadow.len(), "backup applied");

        Ok(msg.reply(MessageType::BackupAck))
    }

    /// Highest packet applied to the shadow table.
    pub fn applied_seq(&self) -> u64 {
        self.slave.lock().applied
    }

    pub fn shadow_len(&self) -> usize {
        self.slave.lock().shadow.len()
    }

    /// Empties the shadow table for promotion; the caller installs the
    /// images as owned lines.
    pub fn take_shadow(&self) -> Vec<OwnedImage> {
        let mut slave = self.slave.lock();
        slave.source = None;
        std::mem::take(&mut slave.shadow)
            .into_iter()
            .map(|(id, (version, data))| (id, version, data))
            .collect()
    }

    /// Periodic flush until `shutdown` is cancelled.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut tick = interval(Duration::from_millis(self.config.flush_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("backup flush loop stopped");
                    return Ok(());
                }
                _ = tick.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!(?e, "periodic backup flush failed");
                    }
                }
            }
        }
    }
}
