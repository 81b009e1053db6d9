use std::fmt::Write;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionError;
use sled::Transactional;
use sled::Tree;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::constants::ALLOCATION_TREE;
use crate::constants::ITEM_TREE;
use crate::constants::META_KEY_ALLOCATION_HIGH_WATER;
use crate::constants::META_TREE;
use crate::constants::OWNER_TREE;
use crate::convert::node_kv;
use crate::convert::node_vk;
use crate::convert::safe_kv;
use crate::convert::safe_vk;
use crate::CasOutcome;
use crate::Error;
use crate::ItemId;
use crate::MainMemoryDb;
use crate::NodeId;
use crate::Result;
use crate::StorageError;
use crate::StoredItem;
use crate::Transaction;
use crate::TxnOp;
use crate::SERVER;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct AllocationRecord {
    count: u64,
    owner: NodeId,
}

/// Sled-backed store.
///
/// Owner CAS maps onto `Tree::compare_and_swap`; committed transactions span
/// the item and owner trees.
pub struct SledMainMemoryDb {
    db: sled::Db,
    owners: Tree,
    items: Tree,
    allocations: Tree,
    meta: Tree,
}

impl std::fmt::Debug for SledMainMemoryDb {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledMainMemoryDb")
            .field("owners", &self.owners.len())
            .field("items", &self.items.len())
            .finish()
    }
}

impl SledMainMemoryDb {
    pub fn new(db: sled::Db) -> Result<Self> {
        Ok(Self {
            owners: db.open_tree(OWNER_TREE)?,
            items: db.open_tree(ITEM_TREE)?,
            allocations: db.open_tree(ALLOCATION_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
        })
    }

    pub(crate) fn high_water(&self) -> Result<ItemId> {
        match self.meta.get(META_KEY_ALLOCATION_HIGH_WATER)? {
            Some(v) => safe_vk(v),
            None => Ok(0),
        }
    }

    fn encode_item(
        version: u64,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&StoredItem {
            version,
            data: data.to_vec(),
        })?)
    }

    fn apply_now(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<()> {
        // encoded outside the closure, sled may run it more than once
        let mut encoded = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                TxnOp::Write {
                    id,
                    owner,
                    version,
                    data,
                } => encoded.push((
                    *id,
                    Some((Self::encode_item(*version, data)?, node_kv(*owner))),
                )),
                TxnOp::Delete { id } => encoded.push((*id, None)),
            }
        }

        (&self.items, &self.owners)
            .transaction(|(items, owners)| {
                for (id, value) in &encoded {
                    let key = safe_kv(*id);
                    match value {
                        Some((item, owner)) => {
                            items.insert(&key[..], &item[..])?;
                            owners.insert(&key[..], &owner[..])?;
                        }
                        None => {
                            items.remove(&key[..])?;
                            owners.remove(&key[..])?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Abort(()) => {
                    StorageError::TransactionAborted("sled aborted".to_string()).into()
                }
                TransactionError::Storage(e) => e.into(),
            })
    }
}

impl MainMemoryDb for SledMainMemoryDb {
    #[instrument(skip(self))]
    fn cas_owner(
        &self,
        id: ItemId,
        expected: Option<NodeId>,
        new: NodeId,
    ) -> Result<CasOutcome> {
        let key = safe_kv(id);
        let old = expected.map(node_kv);
        let swapped = self.owners.compare_and_swap(
            key,
            old.as_ref().map(|v| &v[..]),
            Some(&node_kv(new)[..]),
        )?;
        let outcome = match swapped {
            Ok(()) => CasOutcome::Success(new),
            Err(e) => match e.current {
                Some(current) => CasOutcome::Conflict(node_vk(current)?),
                None => CasOutcome::NotFound,
            },
        };
        trace!(?outcome, "cas_owner");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    fn remove_owner(
        &self,
        node: NodeId,
    ) -> Result<usize> {
        let target = node_kv(node);
        let server = node_kv(SERVER);
        let mut changed = 0;
        for entry in self.owners.iter() {
            let (key, value) = entry?;
            if value[..] != target[..] {
                continue;
            }
            // a concurrent CAS moved the record on; it is no longer ours to clear
            if self
                .owners
                .compare_and_swap(&key, Some(&target[..]), Some(&server[..]))?
                .is_ok()
            {
                changed += 1;
            }
        }

        for entry in self.allocations.iter() {
            let (key, value) = entry?;
            let mut record: AllocationRecord = bincode::deserialize(&value)?;
            if record.owner == node {
                record.owner = SERVER;
                self.allocations.insert(key, bincode::serialize(&record)?)?;
            }
        }
        debug!(changed, "remove_owner");
        Ok(changed)
    }

    fn owner(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>> {
        match self.owners.get(safe_kv(id))? {
            Some(v) => Ok(Some(node_vk(v)?)),
            None => Ok(None),
        }
    }

    fn commit(
        &self,
        txn: Transaction,
    ) -> Result<()> {
        trace!(txn = %txn.id(), ops = txn.ops().len(), "commit");
        self.apply_now(txn.into_ops())
    }

    fn abort(
        &self,
        txn: Transaction,
    ) -> Result<()> {
        debug!(txn = %txn.id(), ops = txn.ops().len(), "abort");
        Ok(())
    }

    fn write(
        &self,
        id: ItemId,
        owner: NodeId,
        version: u64,
        data: &[u8],
        txn: Option<&mut Transaction>,
    ) -> Result<()> {
        let op = TxnOp::Write {
            id,
            owner,
            version,
            data: Bytes::copy_from_slice(data),
        };
        match txn {
            Some(txn) => {
                txn.push(op);
                Ok(())
            }
            None => self.apply_now(vec![op]),
        }
    }

    fn read(
        &self,
        id: ItemId,
    ) -> Result<Option<(u64, Bytes)>> {
        match self.items.get(safe_kv(id))? {
            Some(v) => {
                let item: StoredItem = bincode::deserialize(&v)?;
                Ok(Some((item.version, Bytes::from(item.data))))
            }
            None => Ok(None),
        }
    }

    fn delete(
        &self,
        id: ItemId,
        txn: Option<&mut Transaction>,
    ) -> Result<()> {
        match txn {
            Some(txn) => {
                txn.push(TxnOp::Delete { id });
                Ok(())
            }
            None => self.apply_now(vec![TxnOp::Delete { id }]),
        }
    }

    #[instrument(skip(self))]
    fn allocate(
        &self,
        owner: NodeId,
        start: ItemId,
        count: u64,
    ) -> Result<()> {
        if count == 0 {
            return Err(StorageError::AllocationOverlap { start, count }.into());
        }
        let record = bincode::serialize(&AllocationRecord { count, owner })?;
        // high-water mark and range record commit together
        (&self.meta, &self.allocations)
            .transaction(|(meta, allocations)| {
                let high_water = match meta.get(META_KEY_ALLOCATION_HIGH_WATER)? {
                    Some(v) => safe_vk(&v).map_err(ConflictableTransactionError::Abort)?,
                    None => 0,
                };
                if start < high_water {
                    return Err(ConflictableTransactionError::Abort(
                        StorageError::AllocationOverlap { start, count }.into(),
                    ));
                }
                meta.insert(META_KEY_ALLOCATION_HIGH_WATER, &safe_kv(start.saturating_add(count))[..])?;
                allocations.insert(&safe_kv(start)[..], &record[..])?;
                Ok::<(), ConflictableTransactionError<Error>>(())
            })
            .map_err(|e: TransactionError<Error>| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => e.into(),
            })
    }

    fn find_allocation(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>> {
        let Some(entry) = self.allocations.range(..=safe_kv(id)).next_back() else {
            return Ok(None);
        };
        let (key, value) = entry?;
        let start = safe_vk(key)?;
        let record: AllocationRecord = bincode::deserialize(&value)?;
        Ok((id - start < record.count).then_some(record.owner))
    }

    fn max_id(&self) -> Result<ItemId> {
        let reserved = self.high_water()?.saturating_sub(1);
        let written = match self.owners.last()? {
            Some((k, _)) => safe_vk(k)?,
            None => 0,
        };
        Ok(reserved.max(written))
    }

    fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn dump(&self) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "owners ({}):", self.owners.len());
        for entry in self.owners.iter() {
            let (k, v) = entry?;
            let _ = writeln!(out, "  {} -> {}", safe_vk(k)?, node_vk(v)?);
        }
        let _ = writeln!(out, "items ({}):", self.items.len());
        for entry in self.items.iter() {
            let (k, v) = entry?;
            let item: StoredItem = bincode::deserialize(&v)?;
            let _ = writeln!(
                out,
                "  {} v{} {} bytes",
                safe_vk(k)?,
                item.version,
                item.data.len()
            );
        }
        let _ = writeln!(out, "allocations ({}):", self.allocations.len());
        for entry in self.allocations.iter() {
            let (k, v) = entry?;
            let record: AllocationRecord = bincode::deserialize(&v)?;
            let _ = writeln!(
                out,
                "  [{}, +{}) -> {}",
                safe_vk(k)?,
                record.count,
                record.owner
            );
        }
        Ok(out)
    }
}
