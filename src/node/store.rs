use std::sync::Arc;

use bytes::Bytes;

use crate::CacheEngine;
use crate::CacheListener;
use crate::ItemId;
use crate::Result;
use crate::StatsSnapshot;
use crate::TxnHandle;

/// Item API of one grid member.
///
/// Every call may exchange coherence messages with other nodes; reads are
/// served locally whenever this node holds a valid copy.
#[derive(Clone, Debug)]
pub struct Store {
    engine: Arc<CacheEngine>,
}

impl Store {
    pub(crate) fn new(engine: Arc<CacheEngine>) -> Self {
        Self { engine }
    }

    /// Current contents of `id`, fetched as a shared copy on a miss.
    pub async fn get(
        &self,
        id: ItemId,
    ) -> Result<Bytes> {
        self.engine.get(id).await
    }

    /// Makes this node the exclusive owner of `id` and returns its version.
    pub async fn getx(
        &self,
        id: ItemId,
    ) -> Result<u64> {
        self.engine.getx(id).await
    }

    pub async fn set(
        &self,
        id: ItemId,
        data: Bytes,
        txn: Option<&TxnHandle>,
    ) -> Result<u64> {
        self.engine.set(id, data, txn).await
    }

    /// Creates a new item owned by this node.
    pub async fn put(
        &self,
        data: Bytes,
    ) -> Result<ItemId> {
        self.engine.put(data).await
    }

    pub async fn del(
        &self,
        id: ItemId,
        txn: Option<&TxnHandle>,
    ) -> Result<()> {
        self.engine.del(id, txn).await
    }

    pub async fn release(
        &self,
        id: ItemId,
    ) -> Result<()> {
        self.engine.release(id).await
    }

    pub fn begin_transaction(&self) -> Result<TxnHandle> {
        self.engine.begin_transaction()
    }

    pub async fn commit(
        &self,
        txn: &TxnHandle,
    ) -> Result<()> {
        self.engine.commit(txn).await
    }

    pub async fn abort(
        &self,
        txn: &TxnHandle,
    ) -> Result<()> {
        self.engine.abort(txn).await
    }

    /// Registers `listener` for the events of one item.
    pub fn listen(
        &self,
        id: ItemId,
        listener: Arc<dyn CacheListener>,
    ) {
        self.engine.listen(id, listener);
    }

    /// Listener for items without one of their own.
    pub fn set_listener(
        &self,
        listener: Arc<dyn CacheListener>,
    ) {
        self.engine.set_listener(listener);
    }

    /// Drops the local shared copy of `id`, if any.
    pub fn invalidate_local(
        &self,
        id: ItemId,
    ) -> bool {
        self.engine.invalidate_local(id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats()
    }
}
