use core::fmt;

use bitvec::vec::BitVec;
use cranelift_entity::EntityRef;
use wcet_cfg::BlockRef;

use super::SetScope;
use crate::{
    AccessAction, AccessTable, BlockIndex, CacheDomain, CacheSetCatalog, LatticeLike, SetAccess,
};

/// The dirtiness of the lines of a write-back cache set.
///
/// `may` holds the blocks which may have been written since they were loaded, `must` the blocks
/// which are dirty whenever they are cached.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DirtyState {
    may: BitVec,
    must: BitVec,
}

impl DirtyState {
    /// A state where every line is clean
    pub fn clean(len: usize) -> Self {
        Self {
            may: BitVec::repeat(false, len),
            must: BitVec::repeat(false, len),
        }
    }

    /// Returns true if evicting `block` may require a write-back
    #[inline]
    pub fn may_be_dirty(&self, block: BlockIndex) -> bool {
        self.may[block.index()]
    }

    /// Returns true if evicting `block` always requires a write-back, whenever it is cached
    #[inline]
    pub fn must_be_dirty(&self, block: BlockIndex) -> bool {
        self.must[block.index()]
    }

    pub(crate) fn apply(&mut self, set: &CacheSetCatalog, action: AccessAction, access: SetAccess) {
        match (action, access) {
            (AccessAction::None, _) => (),
            (AccessAction::Store, SetAccess::Block(block)) => {
                self.may.set(block.index(), true);
                self.must.set(block.index(), true);
            }
            (AccessAction::Store, access) => {
                for block in set.members(access) {
                    self.may.set(block.index(), true);
                }
            }
            // A load may bring a clean copy of a block evicted earlier
            (AccessAction::Load, access) => {
                for block in set.members(access) {
                    self.must.set(block.index(), false);
                }
            }
            (AccessAction::Purge, SetAccess::Block(block)) => {
                self.may.set(block.index(), false);
                self.must.set(block.index(), false);
            }
            (AccessAction::Purge, access) => {
                for block in set.members(access) {
                    self.must.set(block.index(), false);
                }
            }
        }
    }
}

impl LatticeLike for DirtyState {
    fn join(&self, other: &Self) -> Self {
        let mut may = self.may.clone();
        let mut must = self.must.clone();
        for index in 0..may.len() {
            may.set(index, self.may[index] || other.may[index]);
            must.set(index, self.must[index] && other.must[index]);
        }
        Self { may, must }
    }
}

impl fmt::Debug for DirtyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ones = |bits: &BitVec| {
            bits.iter_ones().map(BlockIndex::new).collect::<alloc::vec::Vec<_>>()
        };
        f.debug_struct("DirtyState")
            .field("may", &ones(&self.may))
            .field("must", &ones(&self.must))
            .finish()
    }
}

/// The dirty-line analysis of one set of a write-back cache
pub struct DirtyDomain<'a> {
    scope: SetScope<'a>,
}

impl<'a> DirtyDomain<'a> {
    pub fn new(set: &'a CacheSetCatalog, accesses: &'a AccessTable, associativity: usize) -> Self {
        Self {
            scope: SetScope::new(set, accesses, associativity),
        }
    }
}

impl CacheDomain for DirtyDomain<'_> {
    type State = DirtyState;

    fn debug_name(&self) -> &'static str {
        "cache-dirty"
    }

    fn bottom(&self) -> Self::State {
        DirtyState::clean(self.scope.set.len())
    }

    fn entry(&self) -> Self::State {
        DirtyState::clean(self.scope.set.len())
    }

    fn update(&self, out: &mut Self::State, input: &Self::State, block: BlockRef) {
        out.clone_from(input);
        for (action, access) in self.scope.effects(block) {
            out.apply(self.scope.set, action, access);
        }
    }
}
