use core::fmt;

use bitvec::vec::BitVec;
use cranelift_entity::EntityRef;
use smallvec::{SmallVec, smallvec};
use wcet_cfg::BlockRef;

use super::SetScope;
use crate::{
    AccessAction, AccessTable, Age, AgeVector, BlockIndex, CacheDomain, CacheSetCatalog, Context,
    LatticeLike, SetAccess,
};

/// The persistence information of one scope: a loop, or the whole task.
///
/// A block is absent until it is loaded within the scope. Once loaded, its age is an upper bound
/// on its LRU age, where the associativity itself stands for "possibly evicted". Blocks loaded on
/// some paths only are marked partial.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PersItem {
    ages: AgeVector,
    partial: BitVec,
    evicted: Age,
}

impl PersItem {
    fn new(len: usize, associativity: Age) -> Self {
        Self {
            ages: AgeVector::absent(len),
            partial: BitVec::repeat(false, len),
            evicted: associativity,
        }
    }

    #[inline]
    pub fn age(&self, block: BlockIndex) -> Option<Age> {
        self.ages.age(block)
    }

    /// Returns true if `block` may not have been loaded on every path reaching this point
    #[inline]
    pub fn is_partial(&self, block: BlockIndex) -> bool {
        self.partial[block.index()]
    }

    /// Returns true if `block` was loaded within this scope, and cannot have been evicted since
    #[inline]
    pub fn is_persistent(&self, block: BlockIndex) -> bool {
        self.ages.age(block).is_some_and(|age| age < self.evicted)
    }

    /// The age a block of `access` may have had, from the point of view of the others
    fn bound(&self, set: &CacheSetCatalog, access: SetAccess) -> Age {
        if matches!(access, SetAccess::All) {
            return self.evicted;
        }
        let mut bound = None;
        for block in set.members(access) {
            match self.ages.age(block) {
                Some(age) if !self.is_partial(block) => {
                    bound = Some(bound.map_or(age, |b: Age| b.max(age)));
                }
                _ => return self.evicted,
            }
        }
        bound.unwrap_or(self.evicted)
    }

    fn apply(&mut self, set: &CacheSetCatalog, action: AccessAction, access: SetAccess) {
        // Ages saturate at the eviction marker, they never leave the vector
        let saturate = self.evicted + 1;
        match (action, access) {
            (AccessAction::None, _) => (),
            (AccessAction::Load | AccessAction::Store, SetAccess::Block(block)) => {
                let bound = self.bound(set, access);
                self.ages.age_if(saturate, |index, age| index != block && age < bound);
                self.ages.set_age(block, 0);
                self.partial.set(block.index(), false);
            }
            (AccessAction::Load | AccessAction::Store, access) => {
                let bound = self.bound(set, access);
                self.ages.age_if(saturate, |_, age| age < bound);
                // Blocks of the span may have been loaded for the first time
                for block in set.members(access) {
                    if !self.ages.contains(block) {
                        self.ages.set_age(block, 0);
                        self.partial.set(block.index(), true);
                    }
                }
            }
            (AccessAction::Purge, access) => {
                for block in set.members(access) {
                    if self.ages.contains(block) {
                        self.ages.set_age(block, self.evicted);
                    }
                }
            }
        }
    }

    fn join(&self, other: &Self) -> Self {
        let ages = self.ages.merge_with(&other.ages, |a, b| match (a, b) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        });
        // A block loaded on one side only is loaded on some paths only
        let mut partial = BitVec::repeat(false, self.partial.len());
        for index in 0..self.partial.len() {
            let block = BlockIndex::new(index);
            let is_partial = self.partial[index]
                || other.partial[index]
                || self.ages.contains(block) != other.ages.contains(block);
            partial.set(index, is_partial);
        }
        Self {
            ages,
            partial,
            evicted: self.evicted,
        }
    }
}

impl fmt::Debug for PersItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (block, age) in self.ages.iter() {
            if self.is_partial(block) {
                map.entry(&block, &format_args!("{age}?"));
            } else {
                map.entry(&block, &age);
            }
        }
        map.finish()
    }
}

/// The persistence information of every scope enclosing a program point, innermost first.
///
/// The last level always stands for the whole task, and the levels before it for the loops
/// entered so far.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PersState {
    levels: SmallVec<[PersItem; 2]>,
}

impl PersState {
    /// A state with only the task-wide level, where nothing was loaded yet
    pub fn new(len: usize, associativity: Age) -> Self {
        Self {
            levels: smallvec![PersItem::new(len, associativity)],
        }
    }

    /// The number of levels, including the task-wide one
    #[inline]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Get the `k`-th level, counting from the innermost enclosing loop
    #[inline]
    pub fn level(&self, k: usize) -> Option<&PersItem> {
        self.levels.get(k)
    }

    pub fn levels(&self) -> impl ExactSizeIterator<Item = &PersItem> + '_ {
        self.levels.iter()
    }

    /// Returns true if `block` is persistent at the `k`-th level
    pub fn is_persistent(&self, block: BlockIndex, k: usize) -> bool {
        self.level(k).is_some_and(|item| item.is_persistent(block))
    }

    fn push_loop(&mut self) {
        let fresh = {
            let outer = &self.levels[self.levels.len() - 1];
            PersItem::new(outer.ages.len(), outer.evicted)
        };
        self.levels.insert(0, fresh);
    }

    fn pop_loop(&mut self) {
        assert!(self.levels.len() > 1, "left more loops than were entered");
        self.levels.remove(0);
    }

    pub(crate) fn apply(&mut self, set: &CacheSetCatalog, action: AccessAction, access: SetAccess) {
        for level in self.levels.iter_mut() {
            level.apply(set, action, access);
        }
    }
}

impl LatticeLike for PersState {
    /// Levels are matched from the innermost one. When the states come from different calling
    /// contexts, the outermost levels of the deepest one are dropped.
    fn join(&self, other: &Self) -> Self {
        Self {
            levels: self.levels.iter().zip(other.levels.iter()).map(|(a, b)| a.join(b)).collect(),
        }
    }
}

impl fmt::Debug for PersState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pers")?;
        f.debug_list().entries(self.levels.iter()).finish()
    }
}

/// The multi-level persistence analysis of one cache set, which proves first misses
pub struct PersDomain<'a> {
    scope: SetScope<'a>,
}

impl<'a> PersDomain<'a> {
    pub fn new(set: &'a CacheSetCatalog, accesses: &'a AccessTable, associativity: usize) -> Self {
        Self {
            scope: SetScope::new(set, accesses, associativity),
        }
    }
}

impl CacheDomain for PersDomain<'_> {
    type State = PersState;

    fn debug_name(&self) -> &'static str {
        "cache-pers"
    }

    fn bottom(&self) -> Self::State {
        PersState::new(self.scope.set.len(), self.scope.associativity)
    }

    fn entry(&self) -> Self::State {
        PersState::new(self.scope.set.len(), self.scope.associativity)
    }

    fn update(&self, out: &mut Self::State, input: &Self::State, block: BlockRef) {
        out.clone_from(input);
        for (action, access) in self.scope.effects(block) {
            out.apply(self.scope.set, action, access);
        }
    }

    fn enter_context(&self, state: &mut Self::State, _block: BlockRef, context: Context) {
        if context == Context::Loop {
            state.push_loop();
        }
    }

    fn leave_context(&self, state: &mut Self::State, _block: BlockRef, context: Context) {
        if context == Context::Loop {
            state.pop_loop();
        }
    }
}
