//! Cache behavior prediction for static worst-case execution time analysis.
//!
//! Given a [Program] whose blocks are annotated with memory [AccessPoint]s, and the description
//! of a set-associative LRU cache, this crate proves for each access whether it always hits,
//! always misses, misses only on the first iteration of some loop, or cannot be classified.
//!
//! The analysis is organized as follows:
//!
//! * The [Catalog] assigns dense per-set indices to the memory blocks accessed by the program.
//! * Three abstract domains over cache states, [MustDomain], [MayDomain] and [PersDomain], each
//!   implement the [CacheDomain] contract, and are driven to a fixpoint, one cache set at a time,
//!   by the [FixPoint] engine.
//! * The [CategoryBuilder] turns the converged states into a [Category] per access, and
//!   aggregates [CategoryStats].
//!
//! [CacheAnalysis] wires all of this together.
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod access;
mod analysis;
mod cache;
mod catalog;
mod categorize;
mod change_result;
mod config;
mod domain;
pub mod domains;
mod error;
mod lattice;
mod solver;
mod stats;

pub use wcet_cfg::{Address, BlockId, BlockRef, Cfg, CfgId, Program};

pub use self::{
    access::{AccessAction, AccessId, AccessKind, AccessPoint, AccessTable, SetAccess, Target},
    analysis::{CacheAnalysis, CacheAnalysisResults, SetStates},
    cache::{CacheConfig, MAX_ASSOCIATIVITY, Platform, ReplacementPolicy},
    catalog::{BlockIndex, CacheBlock, CacheSetCatalog, Catalog, CatalogBuilder, SetId},
    categorize::{Categories, Category, CategoryBuilder, CategoryInfo},
    change_result::ChangeResult,
    config::{CacheAnalysisConfig, CacheKind, InvalidOptionError, PersistenceMode},
    domain::{CacheDomain, Context},
    domains::{
        DirtyDomain, DirtyState, MayDomain, MayState, MustDomain, MustState, PersDomain, PersItem,
        PersState,
    },
    error::AnalysisError,
    lattice::{Age, AgeVector, LatticeLike},
    solver::{BlockStates, CancellationToken, FixPoint, FixPointConfig},
    stats::CategoryStats,
};

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
