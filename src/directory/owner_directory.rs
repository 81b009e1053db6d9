use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::CasOutcome;
use crate::ItemId;
use crate::MainMemoryDb;
use crate::NodeId;
use crate::Result;
use crate::SERVER;

/// Upper bound of CAS attempts in [`OwnerDirectory::claim`].
const MAX_CLAIM_ATTEMPTS: usize = 4;

impl CasOutcome {
    /// Integer form used by callers of the classic owner CAS contract:
    /// the new owner on success, the observed owner on conflict, `-1` when absent.
    pub fn as_legacy(&self) -> i32 {
        match self {
            CasOutcome::Success(n) | CasOutcome::Conflict(n) => *n as i32,
            CasOutcome::NotFound => -1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CasOutcome::Success(_))
    }
}

#[derive(Clone)]
pub struct OwnerDirectory {
    db: Arc<dyn MainMemoryDb>,
}

impl std::fmt::Debug for OwnerDirectory {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("OwnerDirectory").finish()
    }
}

impl OwnerDirectory {
    pub fn new(db: Arc<dyn MainMemoryDb>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<dyn MainMemoryDb> {
        &self.db
    }

    pub fn cas_owner(
        &self,
        id: ItemId,
        expected: Option<NodeId>,
        new: NodeId,
    ) -> Result<CasOutcome> {
        self.db.cas_owner(id, expected, new)
    }

    /// Owner record of `id`, else the owner of the allocation range covering it.
    pub fn owner_of(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>> {
        match self.db.owner(id)? {
            Some(owner) => Ok(Some(owner)),
            None => self.db.find_allocation(id),
        }
    }

    pub fn remove_owner(
        &self,
        node: NodeId,
    ) -> Result<usize> {
        let changed = self.db.remove_owner(node)?;
        debug!(node, changed, "owner records released");
        Ok(changed)
    }

    pub fn allocate(
        &self,
        owner: NodeId,
        start: ItemId,
        count: u64,
    ) -> Result<()> {
        self.db.allocate(owner, start, count)
    }

    pub fn find_allocation(
        &self,
        id: ItemId,
    ) -> Result<Option<NodeId>> {
        self.db.find_allocation(id)
    }

    /// Moves ownership of `id` from `from` to `to`.
    ///
    /// An item without a record but inside a range allocated to `from` (or
    /// unallocated when `from` is the server) gets its first record here.
    pub fn transfer(
        &self,
        id: ItemId,
        from: NodeId,
        to: NodeId,
    ) -> Result<CasOutcome> {
        match self.db.cas_owner(id, Some(from), to)? {
            CasOutcome::NotFound => {
                let allocated = self.db.find_allocation(id)?.unwrap_or(SERVER);
                if allocated == from {
                    self.db.cas_owner(id, None, to)
                } else {
                    Ok(CasOutcome::NotFound)
                }
            }
            outcome => Ok(outcome),
        }
    }

    /// Takes ownership of `id` for `me`, retrying conflicts whose observed
    /// owner `accept` approves.
    ///
    /// Conflicts with owners that are not accepted are returned to the
    /// caller untouched. Observing `me` already in place counts as success.
    pub fn claim<F>(
        &self,
        id: ItemId,
        expected: NodeId,
        me: NodeId,
        accept: F,
    ) -> Result<CasOutcome>
    where
        F: Fn(NodeId) -> bool,
    {
        let mut expected = expected;
        let mut outcome = CasOutcome::NotFound;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            outcome = self.transfer(id, expected, me)?;
            match outcome {
                CasOutcome::Conflict(current) if current == me => {
                    return Ok(CasOutcome::Success(me));
                }
                CasOutcome::Conflict(current) if accept(current) => {
                    warn!(id, expected, current, "owner record moved, retrying claim");
                    expected = current;
                }
                _ => return Ok(outcome),
            }
        }
        Ok(outcome)
    }
}
