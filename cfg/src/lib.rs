//! Control-flow graph model consumed by the WCET cache analyses.
//!
//! A [Program] is an arena of [Cfg]s, one per function, with a designated entry CFG (the task
//! being analyzed). Each [Cfg] has a synthetic entry and exit block, basic blocks carrying an
//! address range, and call blocks which transfer control to another CFG of the program.
//!
//! Building a [Cfg] computes everything the analyses need about its shape: a reverse post-order,
//! the dominator tree, back edges, and the loop nesting forest.
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod dominance;
mod graph;
mod loops;
mod program;

pub use cranelift_entity::EntityRef;

pub use self::{
    dominance::DominatorTree,
    graph::{Address, BlockData, BlockId, BlockKind, Cfg, CfgBuilder, EdgeData, EdgeId},
    loops::LoopForest,
    program::{BlockRef, CfgId, Program, ProgramBuilder},
};

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;

/// Errors raised while building or validating control-flow graphs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CfgError {
    #[error("block {block} of '{cfg}' is not reachable from the entry block")]
    UnreachableBlock { cfg: alloc::string::String, block: BlockId },
    #[error("'{cfg}' is irreducible: edge {from} -> {to} enters a cycle away from its header")]
    Irreducible {
        cfg: alloc::string::String,
        from: BlockId,
        to: BlockId,
    },
    #[error("edge {from} -> {to} of '{cfg}' leaves the exit block or enters the entry block")]
    InvalidEdge {
        cfg: alloc::string::String,
        from: BlockId,
        to: BlockId,
    },
    #[error("cfg {0} was declared but never defined")]
    Undefined(CfgId),
    #[error("'{caller}' calls {callee}, which does not belong to this program")]
    UnknownCallee { caller: alloc::string::String, callee: CfgId },
    #[error("'{0}' is (mutually) recursive, which context-inlining analyses cannot handle")]
    Recursive(alloc::string::String),
}
