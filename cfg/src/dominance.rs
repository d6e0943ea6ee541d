use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::{BlockData, BlockId, EdgeData, EdgeId};

/// The dominator tree of a [crate::Cfg].
///
/// Computed with the iterative algorithm from _A Simple, Fast Dominance Algorithm_, by Keith D.
/// Cooper, Timothy J. Harvey and Ken Kennedy, which converges in a couple of passes over the
/// reverse post-order for reducible graphs.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: SecondaryMap<BlockId, Option<BlockId>>,
    rpo_index: SecondaryMap<BlockId, u32>,
}

impl DominatorTree {
    pub(crate) fn compute(
        blocks: &PrimaryMap<BlockId, BlockData>,
        edges: &PrimaryMap<EdgeId, EdgeData>,
        rpo: &[BlockId],
        rpo_index: &SecondaryMap<BlockId, u32>,
    ) -> Self {
        let mut idom = SecondaryMap::<BlockId, Option<BlockId>>::with_capacity(blocks.len());
        let Some(entry) = rpo.first().copied() else {
            return Self {
                idom,
                rpo_index: rpo_index.clone(),
            };
        };
        idom[entry] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for block in rpo.iter().skip(1).copied() {
                let mut new_idom = None;
                for pred in blocks[block].preds.iter().map(|e| edges[*e].source) {
                    if idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, rpo_index, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block] != new_idom {
                    idom[block] = new_idom;
                    changed = true;
                }
            }
        }

        Self {
            idom,
            rpo_index: rpo_index.clone(),
        }
    }

    /// Returns the immediate dominator of `block`, or `None` for the entry and unreachable blocks
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block].filter(|idom| *idom != block)
    }

    #[inline]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom[block].is_some()
    }

    /// Returns true if every path from the entry to `b` passes through `a`.
    ///
    /// Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            // Dominators always precede the blocks they dominate in reverse post-order
            if self.rpo_index[current] < self.rpo_index[a] {
                return false;
            }
            match self.idom(current) {
                Some(idom) => current = idom,
                None => return false,
            }
        }
    }
}

fn intersect(
    idom: &SecondaryMap<BlockId, Option<BlockId>>,
    rpo_index: &SecondaryMap<BlockId, u32>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_index[a] > rpo_index[b] {
            a = idom[a].expect("processed blocks always have an immediate dominator");
        }
        while rpo_index[b] > rpo_index[a] {
            b = idom[b].expect("processed blocks always have an immediate dominator");
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use crate::CfgBuilder;

    #[test]
    fn diamond_dominance() {
        let mut builder = CfgBuilder::new("diamond");
        let entry = builder.entry();
        let exit = builder.exit();
        let a = builder.add_block(0x0, 4);
        let b = builder.add_block(0x4, 4);
        let c = builder.add_block(0x8, 4);
        let d = builder.add_block(0xc, 4);
        builder.add_edge(entry, a);
        builder.add_edge(a, b);
        builder.add_edge(a, c);
        builder.add_edge(b, d);
        builder.add_edge(c, d);
        builder.add_edge(d, exit);
        let cfg = builder.build().unwrap();
        let domtree = cfg.dominators();

        assert_eq!(domtree.idom(d), Some(a));
        assert_eq!(domtree.idom(b), Some(a));
        assert_eq!(domtree.idom(entry), None);
        assert!(cfg.dominates(a, d));
        assert!(cfg.dominates(d, d));
        assert!(!cfg.dominates(b, d));
        assert!(!cfg.dominates(d, a));
    }
}
