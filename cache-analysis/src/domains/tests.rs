use alloc::vec::Vec;

use cranelift_entity::EntityRef;
use proptest::{collection::vec, prelude::*};
use wcet_cfg::{Address, BlockId, BlockRef, CfgId};

use super::*;
use crate::{
    AccessAction, AccessTable, Age, BlockIndex, CacheConfig, CacheDomain, CacheSetCatalog, Catalog,
    CatalogBuilder, Context, LatticeLike, SetAccess, SetId,
};

const ADDRESSES: [Address; 4] = [0x000, 0x010, 0x020, 0x030];

/// A single set holding four blocks, at indices 1 to 4
fn catalog() -> Catalog {
    let mut builder = CatalogBuilder::new(CacheConfig::new(4, 1, 16).unwrap());
    for address in ADDRESSES {
        builder.obtain(address);
    }
    builder.finish().0
}

fn block(index: usize) -> BlockIndex {
    BlockIndex::new(index)
}

fn span(first: usize, last: usize) -> SetAccess {
    SetAccess::Span {
        first: block(first),
        last: block(last),
    }
}

fn anywhere() -> BlockRef {
    BlockRef::new(CfgId::new(0), BlockId::new(0))
}

type Op = (AccessAction, SetAccess, usize);

fn set_access() -> impl Strategy<Value = SetAccess> {
    prop_oneof![
        4 => (1..=4usize).prop_map(|i| SetAccess::Block(block(i))),
        2 => (1..=4usize, 1..=4usize).prop_map(|(first, last)| span(first, last)),
        1 => Just(SetAccess::All),
    ]
}

fn any_action() -> impl Strategy<Value = AccessAction> {
    prop_oneof![
        4 => Just(AccessAction::Load),
        2 => Just(AccessAction::Store),
        1 => Just(AccessAction::Purge),
        1 => Just(AccessAction::None),
    ]
}

fn load_or_store() -> impl Strategy<Value = AccessAction> {
    prop_oneof![Just(AccessAction::Load), Just(AccessAction::Store)]
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    vec((any_action(), set_access(), any::<usize>()), 0..24)
}

fn must_after(set: &CacheSetCatalog, associativity: Age, ops: &[Op]) -> MustState {
    let mut state = MustState::empty(set.len());
    for (action, access, _) in ops.iter().copied() {
        state.apply(set, associativity, action, access);
    }
    state
}

fn may_after(set: &CacheSetCatalog, associativity: Age, ops: &[Op]) -> MayState {
    let mut state = MayState::empty(set.len());
    for (action, access, _) in ops.iter().copied() {
        state.apply(set, associativity, action, access);
    }
    state
}

fn pers_after(set: &CacheSetCatalog, associativity: Age, loops: usize, ops: &[Op]) -> PersState {
    let table = AccessTable::new();
    let domain = PersDomain::new(set, &table, associativity as usize);
    let mut state = domain.entry();
    for _ in 0..loops {
        domain.enter_context(&mut state, anywhere(), Context::Loop);
    }
    for (action, access, _) in ops.iter().copied() {
        state.apply(set, action, access);
    }
    state
}

/// A concrete LRU cache set, most recently used line first
struct Lru {
    ways: usize,
    lines: Vec<usize>,
}

impl Lru {
    fn touch(&mut self, line: usize) {
        self.lines.retain(|l| *l != line);
        self.lines.insert(0, line);
        self.lines.truncate(self.ways);
    }

    fn age(&self, block: BlockIndex) -> Option<usize> {
        self.lines.iter().position(|line| *line == block.index())
    }
}

proptest! {
    #[test]
    fn must_join_keeps_common_blocks_at_their_oldest(a in ops(), b in ops(), c in ops()) {
        let catalog = catalog();
        let set = catalog.set(SetId::new(0));
        let (a, b, c) = (must_after(set, 2, &a), must_after(set, 2, &b), must_after(set, 2, &c));

        let joined = a.join(&b);
        prop_assert_eq!(&joined, &b.join(&a));
        prop_assert_eq!(&a.join(&a), &a);
        prop_assert_eq!(joined.join(&c), a.join(&b.join(&c)));
        for index in set.real_indices() {
            if let Some(age) = joined.age(index) {
                prop_assert!(a.contains(index) && b.contains(index));
                prop_assert_eq!(Some(age), a.age(index).max(b.age(index)));
            }
        }
    }

    #[test]
    fn may_join_keeps_every_block_at_its_youngest(a in ops(), b in ops(), c in ops()) {
        let catalog = catalog();
        let set = catalog.set(SetId::new(0));
        let (a, b, c) = (may_after(set, 2, &a), may_after(set, 2, &b), may_after(set, 2, &c));

        let joined = a.join(&b);
        prop_assert_eq!(&joined, &b.join(&a));
        prop_assert_eq!(&a.join(&a), &a);
        prop_assert_eq!(joined.join(&c), a.join(&b.join(&c)));
        for index in set.real_indices() {
            match (a.age(index), b.age(index)) {
                (None, None) => prop_assert!(!joined.contains(index)),
                (Some(x), Some(y)) => prop_assert_eq!(joined.age(index), Some(x.min(y))),
                (x, y) => prop_assert_eq!(joined.age(index), x.or(y)),
            }
        }
    }

    #[test]
    fn pers_join_is_a_semilattice(
        a in ops(),
        b in ops(),
        c in ops(),
        loops in (0..2usize, 0..2usize, 0..2usize),
    ) {
        let catalog = catalog();
        let set = catalog.set(SetId::new(0));
        let a = pers_after(set, 2, loops.0, &a);
        let b = pers_after(set, 2, loops.1, &b);
        let c = pers_after(set, 2, loops.2, &c);

        let joined = a.join(&b);
        prop_assert_eq!(&joined, &b.join(&a));
        prop_assert_eq!(&a.join(&a), &a);
        prop_assert_eq!(joined.join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(joined.depth(), a.depth().min(b.depth()));
    }

    /// Every block the MUST state holds is cached, at most as old as claimed, and every cached
    /// block is in the MAY state, at least as old as claimed.
    #[test]
    fn abstract_states_bound_a_concrete_lru_set(
        associativity in 1..=4u8,
        accesses in vec((load_or_store(), set_access(), any::<usize>()), 0..32),
    ) {
        let catalog = catalog();
        let set = catalog.set(SetId::new(0));
        let mut must = MustState::empty(set.len());
        let mut may = MayState::empty(set.len());
        let mut lru = Lru { ways: associativity as usize, lines: Vec::new() };
        // Lines standing for memory outside the catalog
        let mut foreign = 100;

        for (action, access, choice) in accesses {
            let members = set.members(access).collect::<Vec<_>>();
            let line = match access {
                SetAccess::Block(index) => index.index(),
                SetAccess::Span { .. } => members[choice % members.len()].index(),
                SetAccess::All => match choice % (members.len() + 1) {
                    i if i < members.len() => members[i].index(),
                    _ => {
                        foreign += 1;
                        foreign
                    }
                },
            };
            lru.touch(line);
            must.apply(set, associativity, action, access);
            may.apply(set, associativity, action, access);

            for index in set.real_indices() {
                if let Some(age) = must.age(index) {
                    prop_assert!(
                        lru.age(index).is_some_and(|actual| actual <= age as usize),
                        "{index} is not cached as {must:?} claims, lines = {:?}", lru.lines
                    );
                }
                if let Some(actual) = lru.age(index) {
                    prop_assert!(
                        may.age(index).is_some_and(|age| age as usize <= actual),
                        "{index} is cached at age {actual}, but {may:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn must_ranges_age_without_freshening() {
    let catalog = catalog();
    let set = catalog.set(SetId::new(0));
    let mut must = MustState::empty(set.len());
    for index in [1, 2, 3] {
        must.apply(set, 4, AccessAction::Load, SetAccess::Block(block(index)));
    }
    assert_eq!(
        must.ages().iter().collect::<Vec<_>>(),
        &[(block(1), 2), (block(2), 1), (block(3), 0)]
    );

    // The accessed block is at most as old as block 2, only younger blocks may age
    must.apply(set, 4, AccessAction::Load, span(2, 3));
    assert_eq!(must.age(block(3)), Some(1));
    assert_eq!(must.age(block(2)), Some(1));
    assert_eq!(must.age(block(1)), Some(2));

    // Block 4 is not cached, so the access may be a miss
    must.apply(set, 4, AccessAction::Load, span(3, 4));
    assert_eq!(must.age(block(3)), Some(2));
    assert_eq!(must.age(block(2)), Some(2));
    assert_eq!(must.age(block(1)), Some(3));
    assert!(!must.contains(block(4)));

    must.apply(set, 4, AccessAction::Purge, span(1, 2));
    assert_eq!(must.ages().iter().collect::<Vec<_>>(), &[(block(3), 2)]);
}

#[test]
fn unknown_accesses_freshen_every_may_block() {
    let catalog = catalog();
    let set = catalog.set(SetId::new(0));
    let mut may = MayState::empty(set.len());
    may.apply(set, 2, AccessAction::Load, SetAccess::All);

    assert_eq!(
        may.ages().iter().collect::<Vec<_>>(),
        &[(block(1), 0), (block(2), 0), (block(3), 0), (block(4), 0)]
    );
    // Which block was purged is unknown
    may.apply(set, 2, AccessAction::Purge, span(1, 4));
    assert_eq!(may.ages().iter().count(), 4);
    may.apply(set, 2, AccessAction::Purge, SetAccess::Block(block(2)));
    assert!(!may.contains(block(2)));
}

#[test]
fn pers_levels_follow_loop_nesting() {
    let catalog = catalog();
    let set = catalog.set(SetId::new(0));
    let table = AccessTable::new();
    let domain = PersDomain::new(set, &table, 2);

    let mut state = domain.entry();
    state.apply(set, AccessAction::Load, SetAccess::Block(block(1)));
    domain.enter_context(&mut state, anywhere(), Context::Loop);
    assert_eq!(state.depth(), 2);
    state.apply(set, AccessAction::Load, SetAccess::Block(block(2)));
    assert!(state.is_persistent(block(2), 0));
    assert!(!state.is_persistent(block(1), 0));
    assert!(state.is_persistent(block(1), 1));

    // Loading a third block evicts the first from the task-wide level
    state.apply(set, AccessAction::Load, SetAccess::Block(block(3)));
    assert_eq!(state.level(1).unwrap().age(block(1)), Some(2));
    assert!(!state.is_persistent(block(1), 1));
    assert!(state.is_persistent(block(2), 0));

    domain.leave_context(&mut state, anywhere(), Context::Loop);
    assert_eq!(state.depth(), 1);
    assert!(state.is_persistent(block(3), 0));
    // Calls do not open a scope of their own
    domain.enter_context(&mut state, anywhere(), Context::Call);
    assert_eq!(state.depth(), 1);
}

#[test]
fn pers_blocks_loaded_on_some_paths_are_partial() {
    let catalog = catalog();
    let set = catalog.set(SetId::new(0));
    let loaded = pers_after(set, 2, 0, &[(AccessAction::Load, SetAccess::Block(block(1)), 0)]);
    let cold = pers_after(set, 2, 0, &[]);

    let joined = loaded.join(&cold);
    let level = joined.level(0).unwrap();
    assert_eq!(level.age(block(1)), Some(0));
    assert!(level.is_partial(block(1)));
    assert!(level.is_persistent(block(1)));

    // Purged blocks remain known, but may be evicted
    let mut purged = joined.clone();
    purged.apply(set, AccessAction::Purge, SetAccess::Block(block(1)));
    assert!(!purged.is_persistent(block(1), 0));
}

#[test]
fn dirty_lines_follow_stores_and_loads() {
    let catalog = catalog();
    let set = catalog.set(SetId::new(0));
    let mut dirty = DirtyState::clean(set.len());

    dirty.apply(set, AccessAction::Store, SetAccess::Block(block(1)));
    dirty.apply(set, AccessAction::Store, span(2, 3));
    assert!(dirty.may_be_dirty(block(1)) && dirty.must_be_dirty(block(1)));
    assert!(dirty.may_be_dirty(block(2)) && !dirty.must_be_dirty(block(2)));
    assert!(!dirty.may_be_dirty(block(4)));

    let clean = DirtyState::clean(set.len());
    let joined = dirty.join(&clean);
    assert!(joined.may_be_dirty(block(1)) && !joined.must_be_dirty(block(1)));

    dirty.apply(set, AccessAction::Load, SetAccess::Block(block(1)));
    assert!(dirty.may_be_dirty(block(1)) && !dirty.must_be_dirty(block(1)));
    dirty.apply(set, AccessAction::Purge, SetAccess::Block(block(1)));
    assert!(!dirty.may_be_dirty(block(1)));
}
