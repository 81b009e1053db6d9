use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use tracing::warn;

use super::engine::CacheEngine;
use super::Line;
use crate::GridError;
use crate::ItemId;
use crate::Result;
use crate::Transaction;

/// Handle of an open grid transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxnHandle {
    id: String,
}

impl TxnHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Line contents before the first write of a transaction.
#[derive(Debug, Clone)]
pub(super) struct PreImage {
    version: u64,
    data: Option<Bytes>,
    deleted: bool,
}

#[derive(Debug)]
pub(super) struct TxnState {
    txn: Transaction,
    pre_images: BTreeMap<ItemId, PreImage>,
}

impl CacheEngine {
    /// Opens a transaction. Lines written under it stay pinned to this node
    /// until [`commit`](Self::commit) or [`abort`](Self::abort).
    pub fn begin_transaction(&self) -> Result<TxnHandle> {
        let txn = self.directory.db().begin_transaction()?;
        let handle = TxnHandle {
            id: txn.id().to_string(),
        };
        self.txns.lock().insert(
            handle.id.clone(),
            TxnState {
                txn,
                pre_images: BTreeMap::new(),
            },
        );
        debug!(txn = handle.id, "transaction started");
        Ok(handle)
    }

    /// Remembers the contents of `l` before `txn` first touches it.
    ///
    /// Called with the line lock held; takes the transaction table lock after it.
    pub(super) fn capture_pre_image(
        &self,
        txn: &TxnHandle,
        l: &Line,
    ) -> Result<()> {
        let mut txns = self.txns.lock();
        let state = txns
            .get_mut(txn.id())
            .ok_or_else(|| GridError::TransactionNotActive(txn.id().to_string()))?;
        state.pre_images.entry(l.id).or_insert_with(|| PreImage {
            version: l.version,
            data: l.data.clone(),
            deleted: l.deleted,
        });
        Ok(())
    }

    fn take_txn(
        &self,
        txn: &TxnHandle,
    ) -> Result<TxnState> {
        self.txns
            .lock()
            .remove(txn.id())
            .ok_or_else(|| GridError::TransactionNotActive(txn.id().to_string()).into())
    }

    /// Writes every line of `txn` to the store in one atomic step and
    /// unpins them. On a store failure the lines are rolled back.
    pub async fn commit(
        self: &Arc<Self>,
        txn: &TxnHandle,
    ) -> Result<()> {
        let TxnState {
            txn: mut store_txn,
            pre_images,
        } = self.take_txn(txn)?;

        for id in pre_images.keys().copied() {
            let buffered = self.with_line(id, |l| {
                if l.locked_by_txn.as_deref() != Some(txn.id()) {
                    return Ok(());
                }
                let db = self.directory.db();
                if l.deleted {
                    db.delete(id, Some(&mut store_txn))
                } else {
                    let data = l.data.clone().unwrap_or_default();
                    db.write(id, self.me, l.version, &data, Some(&mut store_txn))
                }
            });
            if let Err(e) = buffered {
                self.restore(txn, &pre_images);
                self.abort_store(store_txn);
                return Err(e);
            }
        }

        let ops = store_txn.ops().len();
        if let Err(e) = self.directory.db().commit(store_txn) {
            warn!(txn = txn.id(), %e, "commit failed, rolling back");
            self.restore(txn, &pre_images);
            return Err(e);
        }

        for id in pre_images.keys().copied() {
            self.with_line(id, |l| {
                if l.locked_by_txn.as_deref() != Some(txn.id()) {
                    return;
                }
                l.locked_by_txn = None;
                if l.deleted {
                    l.mark_deleted();
                    self.backup.record_deleted(id);
                } else {
                    l.dirty = false;
                }
            });
        }
        debug!(txn = txn.id(), lines = pre_images.len(), ops, "transaction committed");
        self.backup.sync().await
    }

    /// Rolls every line of `txn` back to its pre-image and unpins it.
    pub async fn abort(
        self: &Arc<Self>,
        txn: &TxnHandle,
    ) -> Result<()> {
        let TxnState { txn: store_txn, pre_images } = self.take_txn(txn)?;
        self.restore(txn, &pre_images);
        self.abort_store(store_txn);
        debug!(txn = txn.id(), lines = pre_images.len(), "transaction aborted");
        self.backup.sync().await
    }

    /// Puts pre-images back. Versions keep growing so that copies made of
    /// the rolled back contents look older than the restored line.
    fn restore(
        &self,
        txn: &TxnHandle,
        pre_images: &BTreeMap<ItemId, PreImage>,
    ) {
        for (id, pre) in pre_images {
            self.with_line(*id, |l| {
                if l.locked_by_txn.as_deref() != Some(txn.id()) {
                    return;
                }
                l.locked_by_txn = None;
                l.version = l.version.max(pre.version) + 1;
                l.data = pre.data.clone();
                l.deleted = pre.deleted;
                if !l.deleted {
                    let data = l.data.clone().unwrap_or_default();
                    self.backup.record_owned(*id, l.version, &data);
                }
            });
        }
    }

    fn abort_store(
        &self,
        store_txn: Transaction,
    ) {
        if let Err(e) = self.directory.db().abort(store_txn) {
            warn!(%e, "store transaction abort failed");
        }
    }
}
