use core::fmt;

use wcet_cfg::BlockRef;

use super::SetScope;
use crate::{
    AccessAction, AccessTable, Age, AgeVector, BlockIndex, CacheDomain, CacheSetCatalog,
    LatticeLike, SetAccess,
};

/// The blocks possibly in the cache set, with a lower bound on their age.
///
/// A block absent from this state is guaranteed not to be cached.
#[derive(Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MayState {
    ages: AgeVector,
}

impl MayState {
    /// A state where nothing can be cached
    pub fn empty(len: usize) -> Self {
        Self {
            ages: AgeVector::absent(len),
        }
    }

    #[inline(always)]
    pub fn ages(&self) -> &AgeVector {
        &self.ages
    }

    #[inline]
    pub fn contains(&self, block: BlockIndex) -> bool {
        self.ages.contains(block)
    }

    #[inline]
    pub fn age(&self, block: BlockIndex) -> Option<Age> {
        self.ages.age(block)
    }

    pub(crate) fn apply(
        &mut self,
        set: &CacheSetCatalog,
        associativity: Age,
        action: AccessAction,
        access: SetAccess,
    ) {
        match (action, access) {
            (AccessAction::None, _) => (),
            (AccessAction::Load | AccessAction::Store, SetAccess::Block(block)) => {
                // Blocks as young as the accessed one may be younger in reality, and age
                let bound = self.ages.age(block).unwrap_or(Age::MAX);
                self.ages.age_if(associativity, |index, age| index != block && age <= bound);
                self.ages.set_age(block, 0);
            }
            (AccessAction::Load | AccessAction::Store, access) => {
                // Any block of the span may have been brought in, no block is known to age
                for block in set.members(access) {
                    self.ages.set_age(block, 0);
                }
            }
            (AccessAction::Purge, SetAccess::Block(block)) => self.ages.remove(block),
            (AccessAction::Purge, _) => (),
        }
    }
}

impl LatticeLike for MayState {
    /// A block may be cached after a join if it may be on either path, at the youngest of its ages
    fn join(&self, other: &Self) -> Self {
        Self {
            ages: self.ages.merge_with(&other.ages, |a, b| match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }),
        }
    }
}

impl fmt::Debug for MayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "may{:?}", &self.ages)
    }
}

/// The MAY analysis of one cache set, which proves misses
pub struct MayDomain<'a> {
    scope: SetScope<'a>,
}

impl<'a> MayDomain<'a> {
    pub fn new(set: &'a CacheSetCatalog, accesses: &'a AccessTable, associativity: usize) -> Self {
        Self {
            scope: SetScope::new(set, accesses, associativity),
        }
    }
}

impl CacheDomain for MayDomain<'_> {
    type State = MayState;

    fn debug_name(&self) -> &'static str {
        "cache-may"
    }

    fn bottom(&self) -> Self::State {
        MayState::empty(self.scope.set.len())
    }

    /// The cache holds none of the cataloged blocks when the task starts
    fn entry(&self) -> Self::State {
        MayState::empty(self.scope.set.len())
    }

    fn update(&self, out: &mut Self::State, input: &Self::State, block: BlockRef) {
        out.clone_from(input);
        for (action, access) in self.scope.effects(block) {
            out.apply(self.scope.set, self.scope.associativity, action, access);
        }
    }
}
