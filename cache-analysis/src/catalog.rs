use alloc::vec::Vec;
use core::fmt;

use cranelift_entity::{EntityRef, PrimaryMap, entity_impl};
use smallvec::{SmallVec, smallvec};
use wcet_cfg::{Address, BlockKind, BlockRef, Program};

use crate::{
    AccessAction, AccessId, AccessKind, AccessPoint, AccessTable, CacheConfig, FxHashMap,
    SetAccess, Target,
};

/// Identifies a set of the analyzed cache
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SetId(u32);
entity_impl!(SetId, "set");

/// The dense index of a [CacheBlock] within the catalog of its set.
///
/// Index `0` and the last index of every set are sentinels which never stand for memory.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockIndex(u32);
entity_impl!(BlockIndex, "cb");

/// An aligned memory block, as seen by the cache set it is mapped to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheBlock {
    pub set: SetId,
    pub index: BlockIndex,
    /// Address of the first byte of the block
    pub address: Address,
}

impl fmt::Display for CacheBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} @ {:#x}", self.set, self.index, self.address)
    }
}

/// The blocks mapped to one cache set, in order of discovery
#[derive(Debug, Clone)]
pub struct CacheSetCatalog {
    set: SetId,
    blocks: Vec<CacheBlock>,
    by_address: FxHashMap<Address, BlockIndex>,
    sealed: bool,
}

impl CacheSetCatalog {
    fn new(set: SetId) -> Self {
        let mut catalog = Self {
            set,
            blocks: Vec::new(),
            by_address: FxHashMap::default(),
            sealed: false,
        };
        catalog.push_sentinel();
        catalog
    }

    fn push_sentinel(&mut self) {
        let index = BlockIndex::new(self.blocks.len());
        self.blocks.push(CacheBlock {
            set: self.set,
            index,
            address: Address::MAX,
        });
    }

    fn obtain(&mut self, address: Address) -> CacheBlock {
        assert!(!self.sealed, "cannot add blocks to a finished catalog");
        if let Some(index) = self.by_address.get(&address) {
            return self.blocks[index.index()];
        }
        let block = CacheBlock {
            set: self.set,
            index: BlockIndex::new(self.blocks.len()),
            address,
        };
        self.blocks.push(block);
        self.by_address.insert(address, block.index);
        block
    }

    fn seal(&mut self) {
        self.push_sentinel();
        self.sealed = true;
    }

    #[inline(always)]
    pub const fn id(&self) -> SetId {
        self.set
    }

    /// The number of entries in this catalog, sentinels included
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// The number of memory blocks mapped to this set
    #[inline]
    pub fn real_len(&self) -> usize {
        self.blocks.len() - if self.sealed { 2 } else { 1 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.real_len() == 0
    }

    pub fn is_sentinel(&self, index: BlockIndex) -> bool {
        index.index() == 0 || (self.sealed && index.index() == self.blocks.len() - 1)
    }

    #[inline]
    pub fn block(&self, index: BlockIndex) -> &CacheBlock {
        &self.blocks[index.index()]
    }

    /// Find the block starting at `address`, which must be aligned on the block size
    pub fn lookup(&self, address: Address) -> Option<BlockIndex> {
        self.by_address.get(&address).copied()
    }

    /// Iterate over the indices of the memory blocks of this set, skipping sentinels
    pub fn real_indices(&self) -> impl DoubleEndedIterator<Item = BlockIndex> + '_ {
        (1..=self.real_len()).map(BlockIndex::new)
    }

    pub fn real_blocks(&self) -> impl Iterator<Item = &CacheBlock> + '_ {
        self.real_indices().map(|index| self.block(index))
    }

    /// Returns true if `index` is one of the blocks `access` may touch.
    ///
    /// A span whose first index is greater than its last wraps around the end of the catalog.
    pub fn covers(&self, access: SetAccess, index: BlockIndex) -> bool {
        if self.is_sentinel(index) || index.index() >= self.blocks.len() {
            return false;
        }
        match access {
            SetAccess::Block(block) => block == index,
            SetAccess::Span { first, last } if first <= last => first <= index && index <= last,
            SetAccess::Span { first, last } => index <= last || first <= index,
            SetAccess::All => true,
        }
    }

    /// Iterate over the memory blocks `access` may touch
    pub fn members(&self, access: SetAccess) -> impl Iterator<Item = BlockIndex> + '_ {
        self.real_indices().filter(move |index| self.covers(access, *index))
    }
}

/// Collects the memory blocks accessed by a program, and the accesses themselves.
///
/// Blocks are assigned dense, per-set indices in the order they are first obtained. The builder
/// is frozen into a read-only [Catalog] (and its [AccessTable]) by [CatalogBuilder::finish].
pub struct CatalogBuilder {
    config: CacheConfig,
    sets: PrimaryMap<SetId, CacheSetCatalog>,
    accesses: AccessTable,
}

impl CatalogBuilder {
    pub fn new(config: CacheConfig) -> Self {
        let mut sets = PrimaryMap::with_capacity(config.set_count());
        for index in 0..config.set_count() {
            sets.push(CacheSetCatalog::new(SetId::new(index)));
        }
        Self {
            config,
            sets,
            accesses: AccessTable::default(),
        }
    }

    #[inline(always)]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the cache block holding `address`, registering it on first use.
    ///
    /// The same address, or any address within the same memory block, always yields the same
    /// cache block.
    pub fn obtain(&mut self, address: Address) -> CacheBlock {
        let set = self.config.set_of(address);
        let base = self.config.base_of(address);
        self.sets[set].obtain(base)
    }

    /// Record an access point, whose blocks must have been obtained from this builder
    pub fn push(&mut self, at: BlockRef, point: AccessPoint) -> AccessId {
        self.accesses.push(at, point)
    }

    /// Record the instruction at `instruction`, in block `at`, accessing `target`.
    ///
    /// A range of addresses is split into one access point per cache set it spans. Ranges too
    /// large to be tracked precisely degrade to an access to an unknown address.
    pub fn add_access(
        &mut self,
        at: BlockRef,
        instruction: Address,
        target: Target,
        action: AccessAction,
    ) -> SmallVec<[AccessId; 2]> {
        let kinds: SmallVec<[AccessKind; 2]> = match target {
            Target::Unknown => smallvec![AccessKind::Unknown],
            Target::Address(address) => smallvec![AccessKind::Single(self.obtain(address))],
            Target::Range { first, last } => self.obtain_range(first, last),
        };
        kinds
            .into_iter()
            .map(|kind| {
                self.accesses.push(
                    at,
                    AccessPoint {
                        instruction,
                        kind,
                        action,
                    },
                )
            })
            .collect()
    }

    fn obtain_range(&mut self, first: Address, last: Address) -> SmallVec<[AccessKind; 2]> {
        let (first, last) = (first.min(last), first.max(last));
        let (first_block, last_block) = (self.config.block_of(first), self.config.block_of(last));
        if first_block == last_block {
            return smallvec![AccessKind::Single(self.obtain(first))];
        }
        let limit = (self.config.set_count() * self.config.associativity()) as Address;
        if last_block - first_block >= limit {
            log::debug!(
                target: "cache-catalog",
                "range {first:#x}..={last:#x} spans more than {limit} blocks, assuming any address"
            );
            return smallvec![AccessKind::Unknown];
        }

        let mut spans = FxHashMap::<SetId, (BlockIndex, BlockIndex)>::default();
        for number in first_block..=last_block {
            let block = self.obtain(self.config.block_address(number));
            spans
                .entry(block.set)
                .and_modify(|(lo, hi)| {
                    *lo = (*lo).min(block.index);
                    *hi = (*hi).max(block.index);
                })
                .or_insert((block.index, block.index));
        }

        let mut kinds = spans
            .into_iter()
            .map(|(set, (first, last))| AccessKind::Range { set, first, last })
            .collect::<SmallVec<[AccessKind; 2]>>();
        kinds.sort_unstable_by_key(|kind| match kind {
            AccessKind::Range { set, .. } => *set,
            _ => SetId::new(0),
        });
        kinds
    }

    /// Record the instruction fetches of every basic block of `program`.
    ///
    /// Each block loads, in address order, every memory block its instructions span. This is how
    /// the accesses of an instruction cache are derived from the program alone.
    pub fn add_fetches(&mut self, program: &Program) {
        for at in program.blocks() {
            let data = program.cfg(at.cfg).block(at.block);
            if !matches!(data.kind, BlockKind::Basic) || data.size == 0 {
                continue;
            }
            let first = self.config.block_of(data.address);
            let last = self.config.block_of(data.last_address());
            for number in first..=last {
                let base = self.config.block_address(number);
                let block = self.obtain(base);
                self.accesses.push(
                    at,
                    AccessPoint {
                        instruction: base.max(data.address),
                        kind: AccessKind::Single(block),
                        action: AccessAction::Load,
                    },
                );
            }
        }
    }

    /// Freeze the catalog, appending the end sentinel of every set
    pub fn finish(mut self) -> (Catalog, AccessTable) {
        for set in self.sets.values_mut() {
            set.seal();
        }
        log::debug!(
            target: "cache-catalog",
            "cataloged {} blocks in {} sets, {} accesses",
            self.sets.values().map(CacheSetCatalog::real_len).sum::<usize>(),
            self.sets.len(),
            self.accesses.len()
        );
        (
            Catalog {
                config: self.config,
                sets: self.sets,
            },
            self.accesses,
        )
    }
}

/// The read-only registry of the memory blocks accessed by a program, per cache set
#[derive(Debug, Clone)]
pub struct Catalog {
    config: CacheConfig,
    sets: PrimaryMap<SetId, CacheSetCatalog>,
}

impl Catalog {
    #[inline(always)]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn set(&self, set: SetId) -> &CacheSetCatalog {
        &self.sets[set]
    }

    pub fn sets(&self) -> impl ExactSizeIterator<Item = &CacheSetCatalog> + '_ {
        self.sets.values()
    }

    /// Find the cache block holding `address`, if it was ever accessed
    pub fn lookup(&self, address: Address) -> Option<CacheBlock> {
        let set = &self.sets[self.config.set_of(address)];
        set.lookup(self.config.base_of(address)).map(|index| *set.block(index))
    }
}
