//! Coherence message exchanges of [`CacheEngine`]: the requesting side
//! (`fetch`, invalidation) and the answering side (`handle_message`).

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::sleep;
use tracing::debug;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::engine::CacheEngine;
use super::CacheListener;
use super::Line;
use super::ListenerEvent;
use super::PendingKind;
use super::PendingOp;
use crate::utils::async_task::jittered;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::CasOutcome;
use crate::GridError;
use crate::ItemId;
use crate::Message;
use crate::MessageType;
use crate::NetworkError;
use crate::NodeId;
use crate::Result;
use crate::SERVER;

/// Rounds of invalidate-then-delete an incoming DEL may take.
const MAX_DEL_ROUNDS: usize = 3;

/// Outcome of taking a line from the backing store.
#[derive(Debug)]
pub(super) enum Claim {
    Done,
    /// Someone else holds the owner record
    Redirect(NodeId),
    /// No contents in the store
    Missing,
}

/// Answer to an incoming request plus the event to raise once the line
/// lock is released.
struct Answer {
    reply: Message,
    event: Option<(Option<Arc<dyn CacheListener>>, ListenerEvent)>,
}

impl Answer {
    fn reply(reply: Message) -> Self {
        Self { reply, event: None }
    }
}

enum Lookup {
    Reply(Message),
    /// Line installed from the store, look at it again
    Loaded,
}

enum DelStep {
    Reply(Message),
    Invalidate,
    Lookup,
}

fn request_type(kind: PendingKind) -> MessageType {
    match kind {
        PendingKind::Get => MessageType::Get,
        PendingKind::GetX => MessageType::GetX,
        PendingKind::Del => MessageType::Del,
        PendingKind::Inv => MessageType::Inv,
    }
}

/// CHNGD_OWNR carrying `hint`. A hint pointing back at the requester is
/// useless to it and replaced by [`SERVER`].
fn changed_owner(
    msg: &Message,
    hint: NodeId,
) -> Message {
    let hint = if hint == msg.from { SERVER } else { hint };
    msg.reply(MessageType::ChngdOwnr).with_nodes(vec![hint])
}

impl CacheEngine {
    // -
    // Requesting side

    /// Brings the line of `id` to the state `kind` needs by talking to its
    /// owner, following redirects and retrying per the protocol policy.
    #[instrument(skip(self), fields(me = self.me))]
    pub(super) async fn fetch(
        self: &Arc<Self>,
        id: ItemId,
        kind: PendingKind,
    ) -> Result<()> {
        let policy = self.retry.protocol;
        let mut attempt: u32 = 0;
        let mut redirects: u32 = 0;
        let mut target = self.with_line(id, |l| l.owner_hint);

        loop {
            if self.shutdown.is_cancelled() {
                return Err(GridError::Shutdown.into());
            }

            let owner = match target.take() {
                Some(owner) => owner,
                None => match self.directory.owner_of(id)? {
                    Some(owner) => owner,
                    None => return Err(GridError::RefNotFound(id).into()),
                },
            };

            if owner == SERVER || owner == self.me {
                match self.claim_from_store(id, owner)? {
                    Claim::Done => {
                        if kind == PendingKind::Del {
                            self.with_line(id, |l| self.delete_owned_locked(l))?;
                        }
                        return Ok(());
                    }
                    Claim::Missing => {
                        self.with_line(id, |l| l.mark_deleted());
                        return Err(GridError::RefNotFound(id).into());
                    }
                    Claim::Redirect(current) => {
                        trace!(id, current, "store claim lost to another owner");
                        redirects += 1;
                        if redirects <= self.config.max_redirects {
                            target = Some(current);
                            continue;
                        }
                        redirects = 0;
                        attempt += 1;
                    }
                }
            } else {
                let req = Message::line(request_type(kind), id, self.me, owner).with_seq(self.pending.next_seq());
                let rx = self.pending.register(&req);
                let reply = match self.send(req.clone()).await {
                    Ok(()) => self.pending.wait(&req, rx, policy.timeout()).await,
                    Err(e) => {
                        debug!(id, owner, %e, "request not sent");
                        self.pending.remove(&req);
                        None
                    }
                };

                match reply {
                    None => {
                        self.stats.timeout();
                        self.with_line(id, |l| l.owner_hint = None);
                        attempt += 1;
                    }
                    Some(reply) => match reply.kind {
                        MessageType::Put => {
                            let data = reply.data.clone().unwrap_or_default();
                            let applied = self.with_line(id, |l| {
                                l.apply_put(reply.from, reply.version, data.clone())
                                    .then(|| l.listener.clone())
                            });
                            match applied {
                                Some(listener) => {
                                    self.notify(
                                        listener,
                                        ListenerEvent::Received {
                                            id,
                                            version: reply.version,
                                            data,
                                        },
                                    );
                                    return Ok(());
                                }
                                None => {
                                    debug!(id, version = reply.version, "stale shared copy dropped");
                                    self.stats.stale();
                                    attempt += 1;
                                }
                            }
                        }
                        MessageType::PutX => {
                            self.complete_putx(id, &reply).await?;
                            if kind == PendingKind::Del {
                                self.with_line(id, |l| self.delete_owned_locked(l))?;
                            }
                            return Ok(());
                        }
                        MessageType::Ack => {
                            self.with_line(id, |l| l.mark_deleted());
                            return Ok(());
                        }
                        MessageType::NotFound => {
                            self.with_line(id, |l| l.mark_deleted());
                            return Err(GridError::RefNotFound(id).into());
                        }
                        MessageType::ChngdOwnr => {
                            let hint = reply
                                .nodes
                                .first()
                                .copied()
                                .filter(|n| *n != SERVER && *n != owner && *n != self.me);
                            trace!(id, owner, ?hint, "owner changed");
                            self.with_line(id, |l| l.owner_hint = hint);
                            redirects += 1;
                            if redirects <= self.config.max_redirects {
                                target = hint;
                                continue;
                            }
                            redirects = 0;
                            attempt += 1;
                        }
                        MessageType::Nack => {
                            trace!(id, owner, "owner busy");
                            target = Some(owner);
                            attempt += 1;
                        }
                        other => {
                            warn!(id, %other, "unexpected reply kind");
                            attempt += 1;
                        }
                    },
                }
            }

            if attempt > policy.max_retries {
                warn!(id, ?kind, retries = policy.max_retries, "giving up on exchange");
                return Err(GridError::Timeout {
                    id,
                    retries: policy.max_retries,
                }
                .into());
            }
            sleep(jittered(policy, attempt)).await;
        }
    }

    /// Takes the line of `id` from the backing store, where `from` is the
    /// owner the directory reported ([`SERVER`] or this node).
    pub(super) fn claim_from_store(
        &self,
        id: ItemId,
        from: NodeId,
    ) -> Result<Claim> {
        let outcome = if from == self.me {
            CasOutcome::Success(self.me)
        } else {
            self.directory.transfer(id, from, self.me)?
        };
        match outcome {
            CasOutcome::Success(_) => {}
            CasOutcome::Conflict(current) if current == self.me => {}
            CasOutcome::Conflict(current) => return Ok(Claim::Redirect(current)),
            CasOutcome::NotFound => return Ok(Claim::Missing),
        }

        let Some((version, data)) = self.directory.db().read(id)? else {
            if from != self.me {
                self.directory.cas_owner(id, Some(self.me), SERVER)?;
            }
            return Ok(Claim::Missing);
        };
        let installed = self.with_line(id, |l| {
            if l.is_owned() {
                return false;
            }
            l.install_owned(version, data.clone());
            true
        });
        if installed {
            self.backup.record_owned(id, version, &data);
            debug!(id, version, "line loaded from the store");
        }
        Ok(Claim::Done)
    }

    /// Finishes an ownership transfer: moves the owner record, invalidates
    /// the sharers the previous owner handed over and installs the line.
    async fn complete_putx(
        &self,
        id: ItemId,
        reply: &Message,
    ) -> Result<()> {
        let data = reply.data.clone().unwrap_or_default();
        match self.directory.claim(id, reply.from, self.me, |_| true)? {
            CasOutcome::Success(_) => {}
            other => warn!(id, from = reply.from, ?other, "owner record not moved"),
        }

        let sharers: Vec<NodeId> = reply.nodes.iter().copied().filter(|n| *n != self.me).collect();
        let failed = self.invalidate_nodes(id, reply.version, sharers).await;

        self.with_line(id, |l| {
            l.install_owned(reply.version, data.clone());
            l.dirty = true;
            l.sharers.extend(failed);
        });
        self.backup.record_owned(id, reply.version, &data);
        debug!(id, version = reply.version, from = reply.from, "ownership acquired");
        Ok(())
    }

    /// Sends INV for `id` to every node in `nodes`. Returns the nodes that
    /// never acknowledged.
    pub(super) async fn invalidate_nodes(
        &self,
        id: ItemId,
        version: u64,
        nodes: Vec<NodeId>,
    ) -> Vec<NodeId> {
        let policy = self.retry.invalidation;
        // each attempt waits `policy.timeout` for the ack itself
        let outer = BackoffPolicy {
            timeout_ms: policy.timeout_ms * 2,
            ..policy
        };
        let results = join_all(nodes.into_iter().map(|node| async move {
            let result =
                task_with_timeout_and_exponential_backoff(|| self.send_inv(id, version, node, policy), outer).await;
            (node, result)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(node, result)| {
                result.err().map(|e| {
                    warn!(id, node, %e, "sharer did not acknowledge invalidation");
                    node
                })
            })
            .collect()
    }

    async fn send_inv(
        &self,
        id: ItemId,
        version: u64,
        node: NodeId,
        policy: BackoffPolicy,
    ) -> Result<()> {
        // a node that left holds no copy anymore
        if !self.cluster.nodes().contains(&node) {
            return Ok(());
        }
        let msg = Message::line(MessageType::Inv, id, self.me, node)
            .with_seq(self.pending.next_seq())
            .with_version(version);
        let rx = self.pending.register(&msg);
        if let Err(e) = self.send(msg.clone()).await {
            self.pending.remove(&msg);
            return Err(e);
        }
        match self.pending.wait(&msg, rx, policy.timeout()).await {
            Some(_) => Ok(()),
            None => Err(NetworkError::AttemptTimeout(policy.timeout_ms).into()),
        }
    }

    /// Invalidates every sharer of an owned line. Sharers that did not
    /// acknowledge stay recorded.
    pub(super) async fn invalidate_sharers(
        &self,
        id: ItemId,
    ) -> Result<()> {
        let (version, sharers) = self.with_line(id, |l| (l.version, std::mem::take(&mut l.sharers)));
        if sharers.is_empty() {
            return Ok(());
        }
        let count = sharers.len();
        let failed = self.invalidate_nodes(id, version, sharers.into_iter().collect()).await;
        if failed.is_empty() {
            trace!(id, count, "sharers invalidated");
            return Ok(());
        }
        self.with_line(id, |l| l.sharers.extend(failed));
        Err(GridError::Timeout {
            id,
            retries: self.retry.invalidation.max_retries,
        }
        .into())
    }

    // -
    // Answering side

    /// Answers a coherence request from another node.
    pub async fn handle_message(
        self: &Arc<Self>,
        msg: Message,
    ) {
        self.stats.received(msg.kind);
        let Some(id) = msg.id else {
            warn!(%msg, "coherence message without an item id");
            return;
        };
        let answer = match msg.kind {
            MessageType::Get | MessageType::GetX => self.answer_read(id, &msg),
            MessageType::Inv => self.answer_inv(id, &msg),
            MessageType::Del => Answer::reply(self.answer_del(id, &msg).await),
            other => {
                debug!(%other, "not a coherence request");
                return;
            }
        };
        if let Some((listener, event)) = answer.event {
            self.notify(listener, event);
        }
        if let Err(e) = self.send(answer.reply).await {
            debug!(id, %e, "reply not sent");
        }
    }

    fn answer_read(
        &self,
        id: ItemId,
        msg: &Message,
    ) -> Answer {
        for _ in 0..2 {
            if let Some(Some(answer)) = self.with_existing(id, |l| self.read_answer(l, msg)) {
                return answer;
            }
            match self.lookup_owner(id, msg) {
                Lookup::Reply(reply) => return Answer::reply(reply),
                Lookup::Loaded => continue,
            }
        }
        Answer::reply(msg.reply(MessageType::Nack))
    }

    /// Answer from the line alone, `None` when the line knows nothing.
    fn read_answer(
        &self,
        l: &mut Line,
        msg: &Message,
    ) -> Option<Answer> {
        if l.deleted {
            return Some(Answer::reply(msg.reply(MessageType::NotFound)));
        }
        if !l.is_owned() {
            return self.not_owner_reply(l, msg).map(Answer::reply);
        }
        if l.pending.is_some() || l.locked_by_txn.is_some() {
            return Some(Answer::reply(msg.reply(MessageType::Nack)));
        }

        if msg.kind == MessageType::Get {
            l.sharers.insert(msg.from);
            let reply = msg
                .reply(MessageType::Put)
                .with_version(l.version)
                .with_data(l.data.clone().unwrap_or_default());
            return Some(Answer::reply(reply));
        }

        // the record moves before PUTX leaves: once the invalid line is
        // evicted, lookups here find the new owner, and a lost PUTX leaves
        // the contents in the store
        let current = l.data.clone().unwrap_or_default();
        if let Err(e) = self.directory.db().write(l.id, msg.from, l.version, &current, None) {
            warn!(id = l.id, to = msg.from, %e, "owner record not moved, handoff refused");
            return Some(Answer::reply(msg.reply(MessageType::Nack)));
        }
        let (version, data, sharers) = l.handoff(msg.from);
        self.backup.record_released(l.id);
        debug!(id = l.id, version, to = msg.from, "ownership handed off");
        Some(Answer {
            reply: msg
                .reply(MessageType::PutX)
                .with_version(version)
                .with_data(data)
                .with_nodes(sharers),
            event: Some((l.listener.clone(), ListenerEvent::Invalidated(l.id))),
        })
    }

    fn not_owner_reply(
        &self,
        l: &Line,
        msg: &Message,
    ) -> Option<Message> {
        if l.pending.as_ref().is_some_and(|p| p.kind == PendingKind::GetX) {
            return Some(msg.reply(MessageType::Nack));
        }
        l.owner_hint.map(|hint| changed_owner(msg, hint))
    }

    /// Falls back to the owner directory for a line this node knows nothing about.
    fn lookup_owner(
        &self,
        id: ItemId,
        msg: &Message,
    ) -> Lookup {
        match self.directory.owner_of(id) {
            Ok(Some(owner)) if owner == self.me => match self.claim_from_store(id, self.me) {
                Ok(Claim::Done) => Lookup::Loaded,
                Ok(Claim::Missing) => Lookup::Reply(msg.reply(MessageType::NotFound)),
                Ok(Claim::Redirect(current)) => Lookup::Reply(changed_owner(msg, current)),
                Err(e) => {
                    warn!(id, %e, "store read failed");
                    Lookup::Reply(msg.reply(MessageType::Nack))
                }
            },
            Ok(Some(owner)) => Lookup::Reply(changed_owner(msg, owner)),
            Ok(None) => Lookup::Reply(msg.reply(MessageType::NotFound)),
            Err(e) => {
                warn!(id, %e, "owner lookup failed");
                Lookup::Reply(msg.reply(MessageType::Nack))
            }
        }
    }

    fn answer_inv(
        &self,
        id: ItemId,
        msg: &Message,
    ) -> Answer {
        let changed = self
            .with_existing(id, |l| {
                if l.last_inv == Some((msg.from, msg.seq)) {
                    trace!(id, from = msg.from, seq = msg.seq, "duplicate invalidation");
                    return None;
                }
                l.last_inv = Some((msg.from, msg.seq));
                l.invalidate(msg.from, msg.version).then(|| l.listener.clone())
            })
            .flatten();

        let event = changed.map(|listener| {
            self.stats.invalidation();
            (listener, ListenerEvent::Invalidated(id))
        });
        Answer {
            reply: msg.reply(MessageType::InvAck),
            event,
        }
    }

    async fn answer_del(
        self: &Arc<Self>,
        id: ItemId,
        msg: &Message,
    ) -> Message {
        for _ in 0..MAX_DEL_ROUNDS {
            let step = self.with_existing(id, |l| {
                if l.deleted {
                    return DelStep::Reply(msg.reply(MessageType::NotFound));
                }
                if !l.is_owned() {
                    return match self.not_owner_reply(l, msg) {
                        Some(reply) => DelStep::Reply(reply),
                        None => DelStep::Lookup,
                    };
                }
                if l.pending.is_some() || l.locked_by_txn.is_some() {
                    return DelStep::Reply(msg.reply(MessageType::Nack));
                }
                if !l.sharers.is_empty() {
                    l.pending = Some(PendingOp::new(PendingKind::Inv));
                    return DelStep::Invalidate;
                }
                match self.delete_owned_locked(l) {
                    Ok(()) => DelStep::Reply(msg.reply(MessageType::Ack)),
                    Err(e) => {
                        warn!(id, %e, "delete failed");
                        DelStep::Reply(msg.reply(MessageType::Nack))
                    }
                }
            });

            match step.unwrap_or(DelStep::Lookup) {
                DelStep::Reply(reply) => {
                    if reply.kind == MessageType::Ack {
                        if let Err(e) = self.backup.sync().await {
                            warn!(id, %e, "delete not replicated");
                        }
                    }
                    return reply;
                }
                DelStep::Invalidate => {
                    let result = self.invalidate_sharers(id).await.map_err(|e| e.into_grid_error(id));
                    let failed = result.is_err();
                    for w in self.with_line(id, |l| l.finish_pending()) {
                        let _ = w.send(result.clone());
                    }
                    if failed {
                        return msg.reply(MessageType::Nack);
                    }
                }
                DelStep::Lookup => match self.lookup_owner(id, msg) {
                    Lookup::Reply(reply) => return reply,
                    Lookup::Loaded => {}
                },
            }
        }
        msg.reply(MessageType::Nack)
    }
}
