//! Sequential id allocation with recycling.
//!
//! Released ids go into an ordered free set and the smallest one is handed
//! out first, so two nodes replaying the same history allocate the same ids.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Id;

/// Largest hole a single [`IdAllocator::claim`] may open.
pub const MAX_CLAIM_GAP: i64 = 1 << 16;

/// Per-class id allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    /// Next never-used id.
    next: i64,
    /// Released ids waiting to be recycled.
    free: BTreeSet<i64>,
}

impl IdAllocator {
    /// Create an allocator starting at [`Id::FIRST`].
    pub fn new() -> Self {
        Self {
            next: Id::FIRST.raw(),
            free: BTreeSet::new(),
        }
    }

    /// Hand out the smallest recycled id, or the next fresh one.
    pub fn allocate(&mut self) -> Id {
        if let Some(recycled) = self.free.pop_first() {
            return Id(recycled);
        }
        let id = self.next;
        self.next += 1;
        Id(id)
    }

    /// Take a caller-chosen id (system bootstrap, vote, catch-up).
    ///
    /// Ids skipped over by the claim become free.
    pub fn claim(&mut self, id: Id) -> Result<()> {
        if !id.is_standard() {
            return Err(Error::NotRecyclable(id));
        }
        if self.free.remove(&id.raw()) {
            return Ok(());
        }
        if id.raw() < self.next {
            return Err(Error::IdInUse(id));
        }

        let gap = id.raw() - self.next;
        if gap > MAX_CLAIM_GAP {
            return Err(Error::ClaimGapTooLarge { id, gap });
        }
        self.free.extend(self.next..id.raw());
        self.next = id.raw() + 1;
        Ok(())
    }

    /// Return an id for recycling. The caller must have detached every
    /// reference to it first.
    pub fn release(&mut self, id: Id) -> Result<()> {
        if !id.is_standard() {
            return Err(Error::NotRecyclable(id));
        }
        if id.raw() >= self.next {
            return Err(Error::NeverAllocated(id));
        }
        if !self.free.insert(id.raw()) {
            return Err(Error::AlreadyFree(id));
        }
        Ok(())
    }

    /// Whether the id is currently held.
    pub fn is_allocated(&self, id: Id) -> bool {
        id.is_standard() && id.raw() < self.next && !self.free.contains(&id.raw())
    }

    /// Number of ids currently held.
    pub fn allocated_count(&self) -> usize {
        (self.next - Id::FIRST.raw()) as usize - self.free.len()
    }

    /// The next never-used id.
    pub fn next_fresh(&self) -> Id {
        Id(self.next)
    }
}
