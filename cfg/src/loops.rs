use alloc::{string::String, vec::Vec};

use bitvec::vec::BitVec;
use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};

use crate::{BlockData, BlockId, CfgError, DominatorTree, EdgeData, EdgeId, FxHashMap};

/// The natural loops of a reducible [crate::Cfg], organized as a forest.
///
/// Loops are identified by their header block. Back edges sharing a header are merged into a
/// single loop, whose body is the union of their natural loops.
#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    /// Loop headers, in reverse post-order
    headers: Vec<BlockId>,
    /// The body of each loop, as a bit set indexed by block
    bodies: FxHashMap<BlockId, BitVec>,
    /// Maps a header to the header of its parent loop
    parent: SecondaryMap<BlockId, Option<BlockId>>,
    /// Maps a block to the header of the innermost loop containing it (itself, for headers)
    innermost: SecondaryMap<BlockId, Option<BlockId>>,
    depth: SecondaryMap<BlockId, u32>,
    back_edges: SecondaryMap<EdgeId, bool>,
}

impl LoopForest {
    pub(crate) fn compute(
        name: &str,
        blocks: &PrimaryMap<BlockId, BlockData>,
        edges: &PrimaryMap<EdgeId, EdgeData>,
        rpo_index: &SecondaryMap<BlockId, u32>,
        domtree: &DominatorTree,
    ) -> Result<Self, CfgError> {
        let mut forest = Self::default();

        // Identify back edges. Any other retreating edge makes the graph irreducible.
        let mut latches = FxHashMap::<BlockId, Vec<BlockId>>::default();
        for (edge, EdgeData { source, target }) in edges.iter() {
            let (source, target) = (*source, *target);
            if !domtree.is_reachable(source) || rpo_index[target] > rpo_index[source] {
                continue;
            }
            if !domtree.dominates(target, source) {
                return Err(CfgError::Irreducible {
                    cfg: String::from(name),
                    from: source,
                    to: target,
                });
            }
            forest.back_edges[edge] = true;
            latches.entry(target).or_default().push(source);
        }

        forest.headers = latches.keys().copied().collect();
        forest.headers.sort_unstable_by_key(|header| rpo_index[*header]);

        for header in forest.headers.iter().copied() {
            let mut body = BitVec::repeat(false, blocks.len());
            body.set(header.index(), true);
            let mut worklist = latches[&header].clone();
            while let Some(block) = worklist.pop() {
                if body[block.index()] {
                    continue;
                }
                body.set(block.index(), true);
                worklist.extend(
                    blocks[block]
                        .preds
                        .iter()
                        .map(|e| edges[*e].source)
                        .filter(|pred| domtree.is_reachable(*pred)),
                );
            }
            forest.bodies.insert(header, body);
        }

        // Nested loops have strictly smaller bodies than the loops enclosing them, so visiting
        // loops from the smallest to the largest finds the innermost loop of each block first.
        let mut by_size = forest.headers.clone();
        by_size.sort_by_key(|header| forest.bodies[header].count_ones());
        for block in blocks.keys() {
            for header in by_size.iter().copied() {
                if !forest.contains(header, block) {
                    continue;
                }
                forest.depth[block] += 1;
                if forest.innermost[block].is_none() {
                    forest.innermost[block] = Some(header);
                } else if forest.is_header(block) && forest.parent[block].is_none() {
                    forest.parent[block] = Some(header);
                }
            }
        }

        log::trace!(target: "cfg", "found {} loop(s) in '{name}'", forest.headers.len());

        Ok(forest)
    }

    /// The number of loops in the forest
    #[inline]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// The loop headers, in reverse post-order
    #[inline]
    pub fn headers(&self) -> &[BlockId] {
        &self.headers
    }

    #[inline]
    pub fn is_header(&self, block: BlockId) -> bool {
        self.bodies.contains_key(&block)
    }

    #[inline]
    pub fn is_back_edge(&self, edge: EdgeId) -> bool {
        self.back_edges[edge]
    }

    /// Returns true if `block` belongs to the body of the loop headed by `header`
    pub fn contains(&self, header: BlockId, block: BlockId) -> bool {
        self.bodies
            .get(&header)
            .and_then(|body| body.get(block.index()).map(|bit| *bit))
            .unwrap_or(false)
    }

    /// The header of the innermost loop containing `block`, which is `block` itself for headers
    #[inline]
    pub fn innermost(&self, block: BlockId) -> Option<BlockId> {
        self.innermost[block]
    }

    /// The header of the loop enclosing the loop headed by `header`
    #[inline]
    pub fn parent(&self, header: BlockId) -> Option<BlockId> {
        self.parent[header]
    }

    /// The header of the innermost loop strictly enclosing `block`
    pub fn enclosing_header(&self, block: BlockId) -> Option<BlockId> {
        if self.is_header(block) {
            self.parent[block]
        } else {
            self.innermost[block]
        }
    }

    /// The number of loops containing `block`
    #[inline]
    pub fn depth(&self, block: BlockId) -> usize {
        self.depth[block] as usize
    }

    /// Iterates over the headers of all loops containing `block`, innermost first
    pub fn containing(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        core::iter::successors(self.innermost[block], move |header| self.parent[*header])
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use pretty_assertions::assert_eq;

    use crate::{CfgBuilder, CfgError};

    /// entry -> h1 -> h2 -> b -> h2 (inner latch)
    ///                      b -> l1 -> h1 (outer latch)
    ///                h1 -> exit
    #[test]
    fn nested_loops() {
        let mut builder = CfgBuilder::new("nested");
        let entry = builder.entry();
        let exit = builder.exit();
        let h1 = builder.add_block(0x0, 4);
        let h2 = builder.add_block(0x4, 4);
        let b = builder.add_block(0x8, 4);
        let l1 = builder.add_block(0xc, 4);
        builder.add_edge(entry, h1);
        builder.add_edge(h1, h2);
        let exit_edge = builder.add_edge(h1, exit);
        builder.add_edge(h2, b);
        let inner_latch = builder.add_edge(b, h2);
        let inner_exit = builder.add_edge(b, l1);
        let outer_latch = builder.add_edge(l1, h1);
        let cfg = builder.build().unwrap();

        assert_eq!(cfg.loops().headers(), &[h1, h2]);
        assert!(cfg.is_back_edge(inner_latch));
        assert!(cfg.is_back_edge(outer_latch));
        assert!(!cfg.is_back_edge(inner_exit));

        assert_eq!(cfg.loops().innermost(b), Some(h2));
        assert_eq!(cfg.loops().innermost(l1), Some(h1));
        assert_eq!(cfg.enclosing_loop_header(b), Some(h2));
        assert_eq!(cfg.enclosing_loop_header(h2), Some(h1));
        assert_eq!(cfg.enclosing_loop_header(h1), None);
        assert_eq!(cfg.loop_depth(b), 2);
        assert_eq!(cfg.loop_depth(l1), 1);
        assert_eq!(cfg.loop_depth(exit), 0);

        assert_eq!(cfg.loop_exits(inner_exit).collect::<Vec<_>>(), &[h2]);
        assert_eq!(cfg.loop_exits(exit_edge).collect::<Vec<_>>(), &[h1]);
        assert_eq!(cfg.loop_entry(inner_latch), None);
        assert_eq!(cfg.loops().containing(b).collect::<Vec<_>>(), &[h2, h1]);
    }

    #[test]
    fn self_loop() {
        let mut builder = CfgBuilder::new("self");
        let entry = builder.entry();
        let exit = builder.exit();
        let a = builder.add_block(0x0, 4);
        let enter = builder.add_edge(entry, a);
        let latch = builder.add_edge(a, a);
        builder.add_edge(a, exit);
        let cfg = builder.build().unwrap();

        assert!(cfg.is_loop_header(a));
        assert!(cfg.is_back_edge(latch));
        assert_eq!(cfg.loop_entry(enter), Some(a));
        assert_eq!(cfg.enclosing_loop_header(a), None);
    }

    #[test]
    fn irreducible_graphs_are_rejected() {
        // Two blocks jumping to each other, both reachable from the entry
        let mut builder = CfgBuilder::new("irreducible");
        let entry = builder.entry();
        let exit = builder.exit();
        let a = builder.add_block(0x0, 4);
        let b = builder.add_block(0x4, 4);
        builder.add_edge(entry, a);
        builder.add_edge(entry, b);
        builder.add_edge(a, b);
        builder.add_edge(b, a);
        builder.add_edge(b, exit);

        assert!(matches!(builder.build(), Err(CfgError::Irreducible { .. })));
    }
}
