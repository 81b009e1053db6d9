use bytes::Bytes;
use nanoid::nanoid;
use serde::Deserialize;
use serde::Serialize;

use crate::ItemId;
use crate::NodeId;
use crate::Result;

/// Result of a compare-and-swap on an owner record.
///
/// A conflict is an expected outcome under contention, not an error: the
/// caller gets the observed owner back and decides whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The record now holds the carried owner.
    Success(NodeId),
    /// The record holds the carried owner, which differs from the expectation.
    Conflict(NodeId),
    /// An owner was expected but no record exists.
    NotFound,
}

/// Item contents as persisted by the adaptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub version: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Write {
        id: ItemId,
        owner: NodeId,
        version: u64,
        data: Bytes,
    },
    Delete {
        id: ItemId,
    },
}

/// Buffered store mutations applied atomically by [`MainMemoryDb::commit`].
#[derive(Debug)]
pub struct Transaction {
    id: String,
    ops: Vec<TxnOp>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: nanoid!(),
            ops: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        op: TxnOp,
    ) {
        self.ops.push(op);
    }

    pub(crate) fn into_ops(self) -> Vec<TxnOp> {
        self.ops
    }
}

/// Backing store of the grid: owner records, item contents and id
/// allocation ranges.
///
/// Owner records are only mutated through [`cas_owner`](Self::cas_owner),
/// [`remove_owner`](Self::remove_owner), [`write`](Self::write) and
/// [`delete`](Self::delete); each is linearizable on its own. A committed
/// [`Transaction`] applies content and owner changes in one atomic step.
pub trait MainMemoryDb: Send + Sync + 'static {
    /// Compares the owner of `id` with `expected` and replaces it with `new` on match.
    ///
    /// `expected = None` succeeds only when no record exists.
    fn cas_owner(
        &self,
        id: ItemId,
        expected: Option<NodeId>,
        new: NodeId,
    ) -> Result<CasOutcome>;

    /// Reassigns every record owned by `node` to [`SERVER`](crate::SERVER).
    ///
    /// Returns the number of records changed.
    fn remove_owner(
        &self,
        node: NodeId,
    ) -> Result<usize>;

    fn owner(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>>;

    fn begin_transaction(&self) -> Result<Transaction> {
        Ok(Transaction::new())
    }

    fn commit(
        &self,
        txn: Transaction,
    ) -> Result<()>;

    fn abort(
        &self,
        txn: Transaction,
    ) -> Result<()>;

    /// Stores contents of `id` and sets its owner record to `owner`.
    ///
    /// With a transaction the write is buffered until commit.
    fn write(
        &self,
        id: ItemId,
        owner: NodeId,
        version: u64,
        data: &[u8],
        txn: Option<&mut Transaction>,
    ) -> Result<()>;

    /// Returns `(version, data)` of `id`.
    fn read(
        &self,
        id: ItemId,
    ) -> Result<Option<(u64, Bytes)>>;

    /// Removes contents and owner record of `id`.
    fn delete(
        &self,
        id: ItemId,
        txn: Option<&mut Transaction>,
    ) -> Result<()>;

    /// Reserves `[start, start + count)` for `owner`.
    ///
    /// Ranges never overlap; a `start` below the current high-water mark
    /// fails with `StorageError::AllocationOverlap`.
    fn allocate(
        &self,
        owner: NodeId,
        start: ItemId,
        count: u64,
    ) -> Result<()>;

    fn find_allocation(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>>;

    /// Highest id either reserved or written, `0` for an empty store.
    fn max_id(&self) -> Result<ItemId>;

    fn close(&self) -> Result<()>;

    /// Human readable listing of owners and contents, for diagnostics.
    fn dump(&self) -> Result<String>;
}
