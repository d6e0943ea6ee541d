//! The abstract cache domains.
//!
//! Each domain describes the content of a single cache set, over the blocks of its
//! [CacheSetCatalog], and is driven to a fixpoint independently of the others.
//!
//! * [MustDomain] keeps an upper bound on the age of every block guaranteed to be cached
//! * [MayDomain] keeps a lower bound on the age of every block possibly cached
//! * [PersDomain] keeps, for each enclosing loop, the blocks which are never evicted once loaded
//! * [DirtyDomain] tracks the blocks of a write-back cache whose line may, or must, be dirty
mod dirty;
mod may;
mod must;
mod pers;
#[cfg(test)]
mod tests;

use wcet_cfg::BlockRef;

pub use self::{
    dirty::{DirtyDomain, DirtyState},
    may::{MayDomain, MayState},
    must::{MustDomain, MustState},
    pers::{PersDomain, PersItem, PersState},
};
use crate::{AccessAction, AccessTable, Age, CacheSetCatalog, SetAccess};

/// What every domain needs to know about the set it analyzes
#[derive(Copy, Clone)]
struct SetScope<'a> {
    set: &'a CacheSetCatalog,
    accesses: &'a AccessTable,
    associativity: Age,
}

impl<'a> SetScope<'a> {
    fn new(set: &'a CacheSetCatalog, accesses: &'a AccessTable, associativity: usize) -> Self {
        assert!(
            associativity > 0 && associativity <= crate::MAX_ASSOCIATIVITY,
            "unsupported associativity: {associativity}"
        );
        Self {
            set,
            accesses,
            associativity: associativity as Age,
        }
    }

    /// The effects on this set of the accesses of `block`, in execution order
    #[inline]
    fn effects(&self, block: BlockRef) -> impl Iterator<Item = (AccessAction, SetAccess)> + 'a {
        self.accesses.set_accesses(block, self.set.id())
    }
}
