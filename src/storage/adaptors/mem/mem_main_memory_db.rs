use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use tracing::trace;

use crate::CasOutcome;
use crate::ItemId;
use crate::MainMemoryDb;
use crate::NodeId;
use crate::Result;
use crate::StorageError;
use crate::Transaction;
use crate::TxnOp;
use crate::SERVER;

#[derive(Debug, Default)]
struct MemState {
    owners: BTreeMap<ItemId, NodeId>,
    items: BTreeMap<ItemId, (u64, Bytes)>,
    /// start -> (count, owner)
    allocations: BTreeMap<ItemId, (u64, NodeId)>,
    high_water: ItemId,
}

impl MemState {
    fn apply(
        &mut self,
        op: TxnOp,
    ) {
        match op {
            TxnOp::Write {
                id,
                owner,
                version,
                data,
            } => {
                self.items.insert(id, (version, data));
                self.owners.insert(id, owner);
            }
            TxnOp::Delete { id } => {
                self.items.remove(&id);
                self.owners.remove(&id);
            }
        }
    }
}

/// Map-backed store. CAS linearizability comes from the single state lock.
#[derive(Debug, Default)]
pub struct MemMainMemoryDb {
    state: RwLock<MemState>,
    closed: AtomicBool,
}

impl MemMainMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }
}

impl MainMemoryDb for MemMainMemoryDb {
    fn cas_owner(
        &self,
        id: ItemId,
        expected: Option<NodeId>,
        new: NodeId,
    ) -> Result<CasOutcome> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let current = state.owners.get(&id).copied();
        let outcome = match (expected, current) {
            (None, None) => {
                state.owners.insert(id, new);
                CasOutcome::Success(new)
            }
            (None, Some(c)) => CasOutcome::Conflict(c),
            (Some(_), None) => CasOutcome::NotFound,
            (Some(e), Some(c)) if e == c => {
                state.owners.insert(id, new);
                CasOutcome::Success(new)
            }
            (Some(_), Some(c)) => CasOutcome::Conflict(c),
        };
        trace!(id, ?expected, new, ?outcome, "cas_owner");
        Ok(outcome)
    }

    fn remove_owner(
        &self,
        node: NodeId,
    ) -> Result<usize> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let mut changed = 0;
        for owner in state.owners.values_mut() {
            if *owner == node {
                *owner = SERVER;
                changed += 1;
            }
        }
        for (_, owner) in state.allocations.values_mut() {
            if *owner == node {
                *owner = SERVER;
            }
        }
        debug!(node, changed, "remove_owner");
        Ok(changed)
    }

    fn owner(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>> {
        self.ensure_open()?;
        Ok(self.state.read().owners.get(&id).copied())
    }

    fn commit(
        &self,
        txn: Transaction,
    ) -> Result<()> {
        self.ensure_open()?;
        let id = txn.id().to_string();
        let ops = txn.into_ops();
        trace!(txn = %id, ops = ops.len(), "commit");
        let mut state = self.state.write();
        for op in ops {
            state.apply(op);
        }
        Ok(())
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
        self.ensure_open()?;
        let op = TxnOp::Write {
            id,
            owner,
            version,
            data: Bytes::copy_from_slice(data),
        };
        match txn {
            Some(txn) => txn.push(op),
            None => self.state.write().apply(op),
        }
        Ok(())
    }

    fn read(
        &self,
        id: ItemId,
    ) -> Result<Option<(u64, Bytes)>> {
        self.ensure_open()?;
        Ok(self.state.read().items.get(&id).cloned())
    }

    fn delete(
        &self,
        id: ItemId,
        txn: Option<&mut Transaction>,
    ) -> Result<()> {
        self.ensure_open()?;
        match txn {
            Some(txn) => txn.push(TxnOp::Delete { id }),
            None => self.state.write().apply(TxnOp::Delete { id }),
        }
        Ok(())
    }

    fn allocate(
        &self,
        owner: NodeId,
        start: ItemId,
        count: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        if count == 0 || start < state.high_water {
            return Err(StorageError::AllocationOverlap { start, count }.into());
        }
        state.allocations.insert(start, (count, owner));
        state.high_water = start.saturating_add(count);
        debug!(owner, start, count, "allocate");
        Ok(())
    }

    fn find_allocation(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(state
            .allocations
            .range(..=id)
            .next_back()
            .filter(|(start, (count, _))| id - **start < *count)
            .map(|(_, (_, owner))| *owner))
    }

    fn max_id(&self) -> Result<ItemId> {
        self.ensure_open()?;
        let state = self.state.read();
        let reserved = state.high_water.saturating_sub(1);
        let written = state.owners.keys().next_back().copied().unwrap_or(0);
        Ok(reserved.max(written))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn dump(&self) -> Result<String> {
        let state = self.state.read();
        let mut out = String::new();
        let _ = writeln!(out, "owners ({}):", state.owners.len());
        for (id, owner) in &state.owners {
            let _ = writeln!(out, "  {id} -> {owner}");
        }
        let _ = writeln!(out, "items ({}):", state.items.len());
        for (id, (version, data)) in &state.items {
            let _ = writeln!(out, "  {id} v{version} {} bytes", data.len());
        }
        let _ = writeln!(out, "allocations ({}):", state.allocations.len());
        for (start, (count, owner)) in &state.allocations {
            let _ = writeln!(out, "  [{start}, +{count}) -> {owner}");
        }
        Ok(out)
    }
}
