
use core::fmt;

use bitvec::vec::BitVec;
use cranelift_entity::{EntityRef, SecondaryMap};
use smallvec::SmallVec;
use wcet_cfg::{BlockRef, Program};

use crate::{
    AccessAction, AccessId, AccessKind, AccessTable, BlockIndex, CacheAnalysisConfig, Catalog,
    CategoryStats, FxHashMap, PersState, PersistenceMode, SetAccess, SetId, SetStates,
};

/// How an access behaves with respect to the cache, on every execution
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Category {
    /// The access always hits
    AlwaysHit,
    /// The access is counted as a miss on every execution
    AlwaysMiss,
    /// The access misses at most once per execution of the loop headed by its header
    FirstMiss,
    /// Nothing could be proven about the access
    NotClassified,
}

impl Category {
    pub const ALL: [Self; 4] = [
        Self::AlwaysHit,
        Self::AlwaysMiss,
        Self::FirstMiss,
        Self::NotClassified,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlwaysHit => "AH",
            Self::AlwaysMiss => "AM",
            Self::FirstMiss => "FM",
            Self::NotClassified => "NC",
        })
    }
}

/// The category of an access, and for first misses, the header of the loop it refers to.
///
/// When the access is persistent over a whole function execution rather than a loop, the header
/// is the entry block of the function.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CategoryInfo {
    pub category: Category,
    pub header: Option<BlockRef>,
}

impl CategoryInfo {
    pub const fn new(category: Category) -> Self {
        assert!(!matches!(category, Category::FirstMiss), "first misses require a header");
        Self {
            category,
            header: None,
        }
    }

    pub const fn first_miss(header: BlockRef) -> Self {
        Self {
            category: Category::FirstMiss,
            header: Some(header),
        }
    }
}

impl fmt::Display for CategoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header {
            Some(header) => write!(f, "{} ({header})", self.category),
            None => write!(f, "{}", self.category),
        }
    }
}

/// The categories of the accesses of a program, with their statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Categories {
    categories: SecondaryMap<AccessId, Option<CategoryInfo>>,
    stats: CategoryStats,
}

impl Categories {
    /// Get the category of `access`, if it has one.
    ///
    /// Accesses which do not load or store have no category.
    #[inline]
    pub fn get(&self, access: AccessId) -> Option<CategoryInfo> {
        self.categories[access]
    }

    pub fn iter(&self) -> impl Iterator<Item = (AccessId, CategoryInfo)> + '_ {
        self.categories.iter().filter_map(|(id, info)| info.map(|info| (id, info)))
    }

    #[inline(always)]
    pub const fn stats(&self) -> &CategoryStats {
        &self.stats
    }

    fn assign(&mut self, access: AccessId, info: CategoryInfo) {
        assert!(self.categories[access].is_none(), "{access} was categorized twice");
        self.stats.record(info.category);
        self.categories[access] = Some(info);
    }
}

/// Turns the converged abstract cache states into a category per access.
///
/// Each access is decided against the states entering its block, in priority order:
///
/// 1. If every block it may touch is in the MUST state, it always hits.
/// 2. If the MAY analysis ran, and none of these blocks is in the MAY state, it always misses.
/// 3. If the persistence analysis ran, and the blocks are persistent at the level selected by the
///    [PersistenceMode], it is a first miss.
/// 4. Otherwise it is not classified, or counted as a miss when no MAY analysis ran.
///
/// The states entering a block describe its first access to each set only, so later accesses of
/// the block to a set it already touched are counted as misses.
pub struct CategoryBuilder<'a> {
    config: &'a CacheAnalysisConfig,
    program: &'a Program,
    catalog: &'a Catalog,
    accesses: &'a AccessTable,
    states: &'a FxHashMap<SetId, SetStates>,
}

impl<'a> CategoryBuilder<'a> {
    pub fn new(
        config: &'a CacheAnalysisConfig,
        program: &'a Program,
        catalog: &'a Catalog,
        accesses: &'a AccessTable,
        states: &'a FxHashMap<SetId, SetStates>,
    ) -> Self {
        Self {
            config,
            program,
            catalog,
            accesses,
            states,
        }
    }

    pub fn build(&self) -> Categories {
        let mut categories = Categories::default();
        let set_count = self.catalog.config().set_count();

        for (cfg_id, cfg) in self.program.cfgs() {
            for (block, _) in cfg.blocks() {
                let at = BlockRef::new(cfg_id, block);
                let mut touched: BitVec = BitVec::repeat(false, set_count);
                for id in self.accesses.block_accesses(at).iter().copied() {
                    let point = self.accesses.get(id);
                    let first = point.set().is_none_or(|set| !touched[set.index()]);
                    if point.action != AccessAction::None {
                        match point.set() {
                            Some(set) => touched.set(set.index(), true),
                            None => touched.fill(true),
                        }
                    }
                    if !point.action.is_categorized() {
                        continue;
                    }

                    let info = match point.kind {
                        AccessKind::Unknown => self.unclassified(),
                        _ if !first => CategoryInfo::new(Category::AlwaysMiss),
                        AccessKind::Single(block) => {
                            self.classify(at, block.set, SetAccess::Block(block.index))
                        }
                        AccessKind::Range { set, first, last } => {
                            self.classify(at, set, SetAccess::Span { first, last })
                        }
                    };
                    log::trace!(target: "cache-categories", "{at} {point}: {info}");
                    categories.assign(id, info);
                }
            }
        }

        log::debug!(target: "cache-categories", "{}", categories.stats());
        categories
    }

    /// The category of accesses nothing can be proven about
    fn unclassified(&self) -> CategoryInfo {
        if self.config.is_may_analysis_enabled() {
            CategoryInfo::new(Category::NotClassified)
        } else {
            CategoryInfo::new(Category::AlwaysMiss)
        }
    }

    fn classify(&self, at: BlockRef, set: SetId, access: SetAccess) -> CategoryInfo {
        let members = self.catalog.set(set).members(access).collect::<SmallVec<[BlockIndex; 4]>>();
        let Some(states) = self.states.get(&set).filter(|_| !members.is_empty()) else {
            return self.unclassified();
        };

        // A block never reached by the analyses is entered with the bottom states
        if states.must.get(at).is_some_and(|must| members.iter().all(|b| must.contains(*b))) {
            return CategoryInfo::new(Category::AlwaysHit);
        }

        if self.config.is_may_analysis_enabled() {
            let may = states.may.as_ref().and_then(|may| may.get(at));
            if may.is_none_or(|may| members.iter().all(|b| !may.contains(*b))) {
                return CategoryInfo::new(Category::AlwaysMiss);
            }
        }

        // A span over several blocks may miss once for each of them
        if self.config.persistence().is_enabled() && members.len() == 1 {
            let pers = states.pers.as_ref().and_then(|pers| pers.get(at));
            if let Some(header) = pers.and_then(|pers| self.first_miss_header(at, pers, &members)) {
                return CategoryInfo::first_miss(header);
            }
        }

        self.unclassified()
    }

    /// Find the header of the loop over which all of `members` are persistent, according to the
    /// configured [PersistenceMode].
    fn first_miss_header(
        &self,
        at: BlockRef,
        pers: &PersState,
        members: &[BlockIndex],
    ) -> Option<BlockRef> {
        let cfg = self.program.cfg(at.cfg);
        let persistent = |level| members.iter().all(|block| pers.is_persistent(*block, level));

        let mut header = if cfg.is_loop_header(at.block) {
            Some(at.block)
        } else {
            cfg.enclosing_loop_header(at.block)
        };
        let is_persistent = match self.config.persistence() {
            PersistenceMode::None => false,
            PersistenceMode::Inner => persistent(0),
            PersistenceMode::Outer => {
                while let Some(parent) = header.and_then(|h| cfg.enclosing_loop_header(h)) {
                    header = Some(parent);
                }
                persistent(cfg.loop_depth(at.block).saturating_sub(1))
            }
            PersistenceMode::Multi => {
                // Each further persistent level moves the header one loop outward
                let mut is_persistent = false;
                let mut level = 0;
                while header.is_some() && level < pers.depth() && persistent(level) {
                    if is_persistent {
                        header = header.and_then(|h| cfg.enclosing_loop_header(h));
                    }
                    is_persistent = true;
                    level += 1;
                }
                is_persistent
            }
        };

        is_persistent.then(|| BlockRef::new(at.cfg, header.unwrap_or(cfg.entry())))
    }
}
