use core::fmt;

use cranelift_entity::{PrimaryMap, entity_impl};
use smallvec::SmallVec;
use wcet_cfg::{Address, BlockRef};

use crate::{BlockIndex, CacheBlock, FxHashMap, SetId};

/// Identifies an [AccessPoint] within its [AccessTable]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessId(u32);
entity_impl!(AccessId, "acc");

/// What an access does to the cache line it touches
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessAction {
    /// The access bypasses the cache
    None,
    Load,
    Store,
    /// The line is invalidated
    Purge,
}

impl AccessAction {
    /// Returns true if accesses with this action hit or miss, and thus get a category
    #[inline]
    pub const fn is_categorized(&self) -> bool {
        matches!(self, Self::Load | Self::Store)
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Load => "load",
            Self::Store => "store",
            Self::Purge => "purge",
        })
    }
}

/// The memory touched by an access, as resolved against the cache catalog
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessKind {
    /// Any block of any set may be accessed
    Unknown,
    /// Exactly this block is accessed
    Single(CacheBlock),
    /// One block of `set` whose catalog index lies between `first` and `last` is accessed.
    ///
    /// When `first > last`, the span wraps from `first` to the end of the catalog, and continues
    /// from its start up to `last`.
    Range {
        set: SetId,
        first: BlockIndex,
        last: BlockIndex,
    },
}

/// The memory a static instruction accesses, before it is resolved to cache blocks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Target {
    /// The address could not be determined
    Unknown,
    Address(Address),
    /// Some address in `first..=last`
    Range { first: Address, last: Address },
}

/// The effect of an access on one particular cache set
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetAccess {
    Block(BlockIndex),
    Span { first: BlockIndex, last: BlockIndex },
    All,
}

/// A static memory access, performed each time its enclosing block executes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessPoint {
    /// Address of the accessing instruction
    pub instruction: Address,
    pub kind: AccessKind,
    pub action: AccessAction,
}

impl AccessPoint {
    /// Get the effect of this access on `set`, if it touches it at all
    pub fn in_set(&self, set: SetId) -> Option<SetAccess> {
        match self.kind {
            AccessKind::Unknown => Some(SetAccess::All),
            AccessKind::Single(block) if block.set == set => Some(SetAccess::Block(block.index)),
            AccessKind::Range {
                set: range_set,
                first,
                last,
            } if range_set == set => Some(SetAccess::Span { first, last }),
            AccessKind::Single(_) | AccessKind::Range { .. } => None,
        }
    }

    /// The set this access touches, or `None` if it may touch any set
    pub fn set(&self) -> Option<SetId> {
        match self.kind {
            AccessKind::Unknown => None,
            AccessKind::Single(block) => Some(block.set),
            AccessKind::Range { set, .. } => Some(set),
        }
    }
}

impl fmt::Display for AccessPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {} ", self.instruction, self.action)?;
        match self.kind {
            AccessKind::Unknown => f.write_str("*"),
            AccessKind::Single(block) => write!(f, "{block}"),
            AccessKind::Range { set, first, last } => write!(f, "{set}:[{first}..{last}]"),
        }
    }
}

/// The ordered access points of every block of a program
#[derive(Debug, Clone, Default)]
pub struct AccessTable {
    points: PrimaryMap<AccessId, AccessPoint>,
    by_block: FxHashMap<BlockRef, SmallVec<[AccessId; 4]>>,
}

impl AccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `point` to the accesses of block `at`
    pub fn push(&mut self, at: BlockRef, point: AccessPoint) -> AccessId {
        let id = self.points.push(point);
        self.by_block.entry(at).or_default().push(id);
        id
    }

    #[inline]
    pub fn get(&self, id: AccessId) -> &AccessPoint {
        &self.points[id]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (AccessId, &AccessPoint)> + '_ {
        self.points.iter()
    }

    /// The accesses of `block`, in execution order
    pub fn block_accesses(&self, block: BlockRef) -> &[AccessId] {
        self.by_block.get(&block).map(|ids| ids.as_slice()).unwrap_or(&[])
    }

    /// Iterate over the blocks having at least one access
    pub fn blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.by_block.keys().copied()
    }

    /// Iterate over the effects of the accesses of `block` on `set`, in execution order.
    ///
    /// Accesses which bypass the cache have no effect, and are skipped.
    pub fn set_accesses(
        &self,
        block: BlockRef,
        set: SetId,
    ) -> impl Iterator<Item = (AccessAction, SetAccess)> + '_ {
        self.block_accesses(block).iter().filter_map(move |id| {
            let point = &self.points[*id];
            if point.action == AccessAction::None {
                return None;
            }
            point.in_set(set).map(|access| (point.action, access))
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use cranelift_entity::EntityRef;
    use pretty_assertions::assert_eq;
    use wcet_cfg::{BlockId, CfgId};

    use super::*;

    #[test]
    fn set_accesses_filter_by_set_and_action() {
        let at = BlockRef::new(CfgId::new(0), BlockId::new(2));
        let block = |set: usize| CacheBlock {
            set: SetId::new(set),
            index: BlockIndex::new(1),
            address: 0x40 * set as Address,
        };
        let mut table = AccessTable::new();
        let access = |kind, action| AccessPoint {
            instruction: 0x1000,
            kind,
            action,
        };
        table.push(at, access(AccessKind::Single(block(0)), AccessAction::Load));
        table.push(at, access(AccessKind::Single(block(1)), AccessAction::Load));
        table.push(at, access(AccessKind::Single(block(0)), AccessAction::None));
        table.push(at, access(AccessKind::Unknown, AccessAction::Store));

        let effects = table.set_accesses(at, SetId::new(0)).collect::<Vec<_>>();
        assert_eq!(
            effects,
            &[
                (AccessAction::Load, SetAccess::Block(BlockIndex::new(1))),
                (AccessAction::Store, SetAccess::All),
            ]
        );
        assert!(table.block_accesses(BlockRef::new(CfgId::new(0), BlockId::new(3))).is_empty());
    }
}
