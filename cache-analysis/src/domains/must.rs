use core::fmt;

use wcet_cfg::BlockRef;

use super::SetScope;
use crate::{
    AccessAction, AccessTable, Age, AgeVector, BlockIndex, CacheDomain, CacheSetCatalog,
    LatticeLike, SetAccess,
};

/// The blocks guaranteed to be in the cache set, with an upper bound on their age
#[derive(Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MustState {
    ages: AgeVector,
}

impl MustState {
    /// A state where nothing is known to be cached
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
                let bound = self.ages.age(block).unwrap_or(Age::MAX);
                self.ages.age_if(associativity, |index, age| index != block && age < bound);
                self.ages.set_age(block, 0);
            }
            (AccessAction::Load | AccessAction::Store, access) => {
                // The accessed block is one of the span, at most as old as the oldest of them.
                // An access to any block may bring in a block we know nothing about.
                let bound = match access {
                    SetAccess::All => Age::MAX,
                    _ => set
                        .members(access)
                        .try_fold(None, |oldest: Option<Age>, block| {
                            self.ages.age(block).map(|age| Some(oldest.map_or(age, |o| o.max(age))))
                        })
                        .flatten()
                        .unwrap_or(Age::MAX),
                };
                self.ages.age_if(associativity, |_, age| age < bound);
            }
            (AccessAction::Purge, access) => {
                for block in set.members(access) {
                    self.ages.remove(block);
                }
            }
        }
    }
}

impl LatticeLike for MustState {
    /// A block is guaranteed to be cached after a join only if it is on both paths, at the
    /// oldest of its ages.
    fn join(&self, other: &Self) -> Self {
        Self {
            ages: self.ages.merge_with(&other.ages, |a, b| Some(a?.max(b?))),
        }
    }
}

impl fmt::Debug for MustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "must{:?}", &self.ages)
    }
}

/// The MUST analysis of one cache set, which proves hits
pub struct MustDomain<'a> {
    scope: SetScope<'a>,
}

impl<'a> MustDomain<'a> {
    pub fn new(set: &'a CacheSetCatalog, accesses: &'a AccessTable, associativity: usize) -> Self {
        Self {
            scope: SetScope::new(set, accesses, associativity),
        }
    }
}

impl CacheDomain for MustDomain<'_> {
    type State = MustState;

    fn debug_name(&self) -> &'static str {
        "cache-must"
    }

    fn bottom(&self) -> Self::State {
        MustState::empty(self.scope.set.len())
    }

    /// Nothing is known about the content of the cache when the task starts
    fn entry(&self) -> Self::State {
        MustState::empty(self.scope.set.len())
    }

    fn update(&self, out: &mut Self::State, input: &Self::State, block: BlockRef) {
        out.clone_from(input);
        for (action, access) in self.scope.effects(block) {
            out.apply(self.scope.set, self.scope.associativity, action, access);
        }
    }
}
