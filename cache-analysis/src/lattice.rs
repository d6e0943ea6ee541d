use core::fmt;

use cranelift_entity::EntityRef;
use smallvec::SmallVec;

use crate::{BlockIndex, ChangeResult};

/// This trait must be implemented by the abstract states of the cache analyses, which form
/// [join semi-lattices](https://en.wikipedia.org/wiki/Semilattice).
///
/// The join of two states over-approximates both: any concrete cache state described by either
/// operand is described by the result. The cache analyses only ever merge information flowing
/// forward along the control-flow graph, so no `meet` is required.
///
/// Implementations must be commutative, associative and idempotent, and the join must be an upper
/// bound of both operands, i.e. joining it with either operand again leaves it unchanged.
pub trait LatticeLike: Clone + Eq + fmt::Debug {
    /// Joins `self` with `other`, producing the least upper bound of the two states
    fn join(&self, other: &Self) -> Self;

    /// Joins `other` into `self`, reporting whether `self` changed
    fn join_in_place(&mut self, other: &Self) -> ChangeResult {
        let new_value = self.join(other);
        debug_assert_eq!(new_value.join(self), new_value, "expected `join` to be monotonic");
        debug_assert_eq!(new_value.join(other), new_value, "expected `join` to be monotonic");

        let change = ChangeResult::from(new_value != *self);
        *self = new_value;
        change
    }
}

/// The age of a block in an LRU cache set, `0` being the most recently used
pub type Age = u8;

/// Maps each block of a cache set catalog to an age, or to "absent".
///
/// This is the representation shared by the abstract cache states, which interpret the ages as
/// upper bounds (MUST), lower bounds (MAY), or ages since first load (PERS).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AgeVector {
    ages: SmallVec<[Age; 16]>,
}

impl AgeVector {
    const ABSENT: Age = Age::MAX;

    /// Create a vector over `len` catalog entries, all absent
    pub fn absent(len: usize) -> Self {
        Self {
            ages: SmallVec::from_elem(Self::ABSENT, len),
        }
    }

    /// The number of catalog entries covered by this vector
    #[inline]
    pub fn len(&self) -> usize {
        self.ages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ages.is_empty()
    }

    #[inline]
    pub fn age(&self, block: BlockIndex) -> Option<Age> {
        match self.ages[block.index()] {
            Self::ABSENT => None,
            age => Some(age),
        }
    }

    #[inline]
    pub fn contains(&self, block: BlockIndex) -> bool {
        self.ages[block.index()] != Self::ABSENT
    }

    #[inline]
    pub fn set_age(&mut self, block: BlockIndex, age: Age) {
        debug_assert_ne!(age, Self::ABSENT);
        self.ages[block.index()] = age;
    }

    #[inline]
    pub fn remove(&mut self, block: BlockIndex) {
        self.ages[block.index()] = Self::ABSENT;
    }

    /// Returns true if no block is present
    pub fn is_cleared(&self) -> bool {
        self.ages.iter().all(|age| *age == Self::ABSENT)
    }

    /// Iterate over the present blocks and their ages
    pub fn iter(&self) -> impl Iterator<Item = (BlockIndex, Age)> + '_ {
        self.ages
            .iter()
            .enumerate()
            .filter(|(_, age)| **age != Self::ABSENT)
            .map(|(index, age)| (BlockIndex::new(index), *age))
    }

    /// Age every present block for which `predicate` holds by one, dropping the blocks reaching
    /// `limit`.
    pub(crate) fn age_if(
        &mut self,
        limit: Age,
        mut predicate: impl FnMut(BlockIndex, Age) -> bool,
    ) {
        for (index, age) in self.ages.iter_mut().enumerate() {
            if *age == Self::ABSENT || !predicate(BlockIndex::new(index), *age) {
                continue;
            }
            *age += 1;
            if *age >= limit {
                *age = Self::ABSENT;
            }
        }
    }

    /// Combine `self` with `other` entry by entry
    pub(crate) fn merge_with(
        &self,
        other: &Self,
        mut merge: impl FnMut(Option<Age>, Option<Age>) -> Option<Age>,
    ) -> Self {
        assert_eq!(self.len(), other.len(), "cannot merge ages of different cache sets");
        let decode = |age: Age| (age != Self::ABSENT).then_some(age);
        let ages = self
            .ages
            .iter()
            .zip(other.ages.iter())
            .map(|(a, b)| merge(decode(*a), decode(*b)).unwrap_or(Self::ABSENT))
            .collect();
        Self { ages }
    }
}

impl fmt::Debug for AgeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
