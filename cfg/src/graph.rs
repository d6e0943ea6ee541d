use alloc::{string::String, vec::Vec};
use core::fmt;

use cranelift_entity::{PrimaryMap, SecondaryMap, entity_impl};
use smallvec::SmallVec;

use crate::{CfgError, CfgId, DominatorTree, LoopForest};

/// A memory address in the analyzed program
pub type Address = u64;

/// Identifies a block within its [Cfg]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(u32);
entity_impl!(BlockId, "bb");

/// Identifies an edge within its [Cfg]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeId(u32);
entity_impl!(EdgeId, "e");

/// What a block of a [Cfg] stands for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKind {
    /// The synthetic entry block, it has no instructions
    Entry,
    /// The synthetic exit block, it has no instructions
    Exit,
    /// A straight-line sequence of instructions
    Basic,
    /// A synthetic block transferring control to another CFG, and returning from it
    Call(CfgId),
}

#[derive(Debug, Clone)]
pub struct BlockData {
    pub kind: BlockKind,
    /// Address of the first instruction, `0` for synthetic blocks
    pub address: Address,
    /// Size of the block in bytes, `0` for synthetic blocks
    pub size: u32,
    pub(crate) succs: SmallVec<[EdgeId; 2]>,
    pub(crate) preds: SmallVec<[EdgeId; 2]>,
}

impl BlockData {
    fn new(kind: BlockKind, address: Address, size: u32) -> Self {
        Self {
            kind,
            address,
            size,
            succs: SmallVec::new(),
            preds: SmallVec::new(),
        }
    }

    #[inline]
    pub fn is_synthetic(&self) -> bool {
        !matches!(self.kind, BlockKind::Basic)
    }

    /// The address of the last byte of this block, or its first address if it is synthetic.
    ///
    /// Blocks extending past the end of the address space are clamped to it.
    #[inline]
    pub fn last_address(&self) -> Address {
        self.address.saturating_add((self.size as Address).saturating_sub(1))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EdgeData {
    pub source: BlockId,
    pub target: BlockId,
}

/// Incrementally constructs a [Cfg].
///
/// The entry and exit blocks are created up front; all other blocks and edges are added by the
/// caller, after which [CfgBuilder::build] computes the dominance and loop information.
pub struct CfgBuilder {
    name: String,
    blocks: PrimaryMap<BlockId, BlockData>,
    edges: PrimaryMap<EdgeId, EdgeData>,
    entry: BlockId,
    exit: BlockId,
}

impl CfgBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData::new(BlockKind::Entry, 0, 0));
        let exit = blocks.push(BlockData::new(BlockKind::Exit, 0, 0));
        Self {
            name: name.into(),
            blocks,
            edges: PrimaryMap::new(),
            entry,
            exit,
        }
    }

    #[inline(always)]
    pub const fn entry(&self) -> BlockId {
        self.entry
    }

    #[inline(always)]
    pub const fn exit(&self) -> BlockId {
        self.exit
    }

    /// Add a basic block of `size` bytes starting at `address`
    pub fn add_block(&mut self, address: Address, size: u32) -> BlockId {
        self.blocks.push(BlockData::new(BlockKind::Basic, address, size))
    }

    /// Add a synthetic block calling `callee`
    pub fn add_call(&mut self, callee: CfgId) -> BlockId {
        self.blocks.push(BlockData::new(BlockKind::Call(callee), 0, 0))
    }

    pub fn add_edge(&mut self, source: BlockId, target: BlockId) -> EdgeId {
        let edge = self.edges.push(EdgeData { source, target });
        self.blocks[source].succs.push(edge);
        self.blocks[target].preds.push(edge);
        edge
    }

    /// Finalize the graph.
    ///
    /// This fails if a block other than the exit is unreachable from the entry, if an edge leaves
    /// the exit block or enters the entry block, or if the graph is irreducible.
    pub fn build(self) -> Result<Cfg, CfgError> {
        for edge in self.edges.values() {
            if edge.source == self.exit || edge.target == self.entry {
                return Err(CfgError::InvalidEdge {
                    cfg: self.name.clone(),
                    from: edge.source,
                    to: edge.target,
                });
            }
        }

        let rpo = reverse_post_order(&self.blocks, &self.edges, self.entry);
        let mut rpo_index = SecondaryMap::with_default(u32::MAX);
        for (index, block) in rpo.iter().enumerate() {
            rpo_index[*block] = index as u32;
        }
        if let Some(block) = self
            .blocks
            .keys()
            .find(|b| *b != self.exit && rpo_index[*b] == u32::MAX)
        {
            return Err(CfgError::UnreachableBlock {
                cfg: self.name,
                block,
            });
        }

        let domtree = DominatorTree::compute(&self.blocks, &self.edges, &rpo, &rpo_index);
        let loops =
            LoopForest::compute(&self.name, &self.blocks, &self.edges, &rpo_index, &domtree)?;

        log::trace!(
            target: "cfg",
            "built '{}': {} blocks, {} edges, {} loops",
            self.name,
            self.blocks.len(),
            self.edges.len(),
            loops.len()
        );

        Ok(Cfg {
            name: self.name,
            blocks: self.blocks,
            edges: self.edges,
            entry: self.entry,
            exit: self.exit,
            rpo,
            domtree,
            loops,
        })
    }
}

/// Iterative depth-first search computing the reverse post-order of the blocks reachable from
/// `entry`. Successors are explored in insertion order.
fn reverse_post_order(
    blocks: &PrimaryMap<BlockId, BlockData>,
    edges: &PrimaryMap<EdgeId, EdgeData>,
    entry: BlockId,
) -> Vec<BlockId> {
    let mut visited = SecondaryMap::<BlockId, bool>::with_capacity(blocks.len());
    let mut post_order = Vec::with_capacity(blocks.len());
    let mut stack: Vec<(BlockId, usize)> = Vec::with_capacity(blocks.len());
    visited[entry] = true;
    stack.push((entry, 0));
    while let Some((block, next)) = stack.last_mut() {
        let block = *block;
        let succs = &blocks[block].succs;
        if *next < succs.len() {
            let succ = edges[succs[*next]].target;
            *next += 1;
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            post_order.push(block);
            stack.pop();
        }
    }
    post_order.reverse();
    post_order
}

/// A control-flow graph, with its dominance and loop-nesting information
#[derive(Clone)]
pub struct Cfg {
    name: String,
    blocks: PrimaryMap<BlockId, BlockData>,
    edges: PrimaryMap<EdgeId, EdgeData>,
    entry: BlockId,
    exit: BlockId,
    rpo: Vec<BlockId>,
    domtree: DominatorTree,
    loops: LoopForest,
}

impl Cfg {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub const fn entry(&self) -> BlockId {
        self.entry
    }

    #[inline(always)]
    pub const fn exit(&self) -> BlockId {
        self.exit
    }

    #[inline]
    pub fn block(&self, block: BlockId) -> &BlockData {
        &self.blocks[block]
    }

    #[inline]
    pub fn edge(&self, edge: EdgeId) -> &EdgeData {
        &self.edges[edge]
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl ExactSizeIterator<Item = (BlockId, &BlockData)> + '_ {
        self.blocks.iter()
    }

    pub fn edges(&self) -> impl ExactSizeIterator<Item = (EdgeId, &EdgeData)> + '_ {
        self.edges.iter()
    }

    /// The outgoing edges of `block`
    #[inline]
    pub fn succs(&self, block: BlockId) -> &[EdgeId] {
        &self.blocks[block].succs
    }

    /// The incoming edges of `block`
    #[inline]
    pub fn preds(&self, block: BlockId) -> &[EdgeId] {
        &self.blocks[block].preds
    }

    /// The blocks reachable from the entry, in reverse post-order
    #[inline]
    pub fn reverse_post_order(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Returns the callees of all call blocks in this graph
    pub fn callees(&self) -> impl Iterator<Item = CfgId> + '_ {
        self.blocks.values().filter_map(|b| match b.kind {
            BlockKind::Call(callee) => Some(callee),
            _ => None,
        })
    }

    #[inline]
    pub fn dominators(&self) -> &DominatorTree {
        &self.domtree
    }

    #[inline]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.domtree.dominates(a, b)
    }

    #[inline]
    pub fn loops(&self) -> &LoopForest {
        &self.loops
    }

    #[inline]
    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops.is_header(block)
    }

    /// Returns the header of the innermost loop strictly enclosing `block`.
    ///
    /// For a loop header, this is the header of its parent loop, if any.
    #[inline]
    pub fn enclosing_loop_header(&self, block: BlockId) -> Option<BlockId> {
        self.loops.enclosing_header(block)
    }

    #[inline]
    pub fn loop_depth(&self, block: BlockId) -> usize {
        self.loops.depth(block)
    }

    #[inline]
    pub fn is_back_edge(&self, edge: EdgeId) -> bool {
        self.loops.is_back_edge(edge)
    }

    /// Returns the headers of the loops exited when following `edge`, innermost first
    pub fn loop_exits(&self, edge: EdgeId) -> impl Iterator<Item = BlockId> + '_ {
        let EdgeData { source, target } = self.edges[edge];
        self.loops
            .containing(source)
            .take_while(move |header| !self.loops.contains(*header, target))
    }

    /// Returns the header of the loop entered by following `edge`, if any.
    ///
    /// Back edges never enter a loop, they iterate it.
    pub fn loop_entry(&self, edge: EdgeId) -> Option<BlockId> {
        let target = self.edges[edge].target;
        (self.is_loop_header(target) && !self.is_back_edge(edge)).then_some(target)
    }
}

impl fmt::Debug for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cfg")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("exit", &self.exit)
            .field("blocks", &self.blocks.len())
            .field("edges", &self.edges.len())
            .field("loops", &self.loops.len())
            .finish()
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cfg '{}'", self.name)?;
        for block in self.rpo.iter().copied() {
            let data = &self.blocks[block];
            write!(f, "  {block}")?;
            match data.kind {
                BlockKind::Entry => f.write_str(" (entry)")?,
                BlockKind::Exit => f.write_str(" (exit)")?,
                BlockKind::Basic => {
                    write!(f, " @ {:#x}..={:#x}", data.address, data.last_address())?
                }
                BlockKind::Call(callee) => write!(f, " (call {callee})")?,
            }
            if self.is_loop_header(block) {
                f.write_str(" [header]")?;
            }
            f.write_str(" ->")?;
            for edge in data.succs.iter() {
                let target = self.edges[*edge].target;
                if self.is_back_edge(*edge) {
                    write!(f, " ^{target}")?;
                } else {
                    write!(f, " {target}")?;
                }
            }
            f.write_str("\n")?;
        }
        Ok(())
    }
}
