use alloc::{string::String, vec::Vec};
use core::fmt;

use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap, entity_impl};

use crate::{BlockId, Cfg, CfgError};

/// Identifies a [Cfg] within its [Program]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CfgId(u32);
entity_impl!(CfgId, "cfg");

/// A stable, program-wide reference to a block: the pair of its owning CFG and its block id
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockRef {
    pub cfg: CfgId,
    pub block: BlockId,
}

impl BlockRef {
    #[inline]
    pub const fn new(cfg: CfgId, block: BlockId) -> Self {
        Self { cfg, block }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cfg, self.block)
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Collects the CFGs of a program.
///
/// CFGs are declared before they are defined, so that call blocks can refer to functions whose
/// graph has not been built yet.
#[derive(Default)]
pub struct ProgramBuilder {
    names: PrimaryMap<CfgId, String>,
    cfgs: SecondaryMap<CfgId, Option<Cfg>>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for the CFG called `name`
    pub fn declare(&mut self, name: impl Into<String>) -> CfgId {
        self.names.push(name.into())
    }

    /// Attach the graph of a previously declared CFG
    pub fn define(&mut self, id: CfgId, cfg: Cfg) {
        assert!(self.names.is_valid(id), "{id} was not declared by this builder");
        self.cfgs[id] = Some(cfg);
    }

    /// Finalize the program, whose task starts at `entry`.
    ///
    /// Fails if a declared CFG was never defined, if a call block targets an unknown CFG, or if the
    /// call graph has a cycle.
    pub fn build(mut self, entry: CfgId) -> Result<Program, CfgError> {
        let mut cfgs = PrimaryMap::with_capacity(self.names.len());
        for id in self.names.keys() {
            let cfg = self.cfgs[id].take().ok_or(CfgError::Undefined(id))?;
            cfgs.push(cfg);
        }
        if !cfgs.is_valid(entry) {
            return Err(CfgError::Undefined(entry));
        }
        let program = Program { cfgs, entry };
        program.validate()?;
        Ok(program)
    }
}

/// The set of CFGs making up the analyzed task
pub struct Program {
    cfgs: PrimaryMap<CfgId, Cfg>,
    entry: CfgId,
}

impl Program {
    /// Build a program consisting of a single CFG
    pub fn from_cfg(cfg: Cfg) -> Result<Self, CfgError> {
        let mut builder = ProgramBuilder::new();
        let id = builder.declare(cfg.name());
        builder.define(id, cfg);
        builder.build(id)
    }

    /// The CFG of the task entry point
    #[inline(always)]
    pub const fn entry(&self) -> CfgId {
        self.entry
    }

    #[inline]
    pub fn cfg(&self, id: CfgId) -> &Cfg {
        &self.cfgs[id]
    }

    pub fn cfgs(&self) -> impl ExactSizeIterator<Item = (CfgId, &Cfg)> + '_ {
        self.cfgs.iter()
    }

    /// Returns true if `block` designates a block of this program
    pub fn contains(&self, block: BlockRef) -> bool {
        self.cfgs.get(block.cfg).is_some_and(|cfg| block.block.index() < cfg.num_blocks())
    }

    /// Iterate over every block of every CFG of the program
    pub fn blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.cfgs
            .iter()
            .flat_map(|(id, cfg)| cfg.blocks().map(move |(block, _)| BlockRef::new(id, block)))
    }

    /// Check that every call targets a CFG of this program, and that the call graph is acyclic
    pub fn validate(&self) -> Result<(), CfgError> {
        #[derive(Copy, Clone, PartialEq, Eq, Default)]
        enum Mark {
            #[default]
            Unvisited,
            Active,
            Done,
        }

        let mut marks = SecondaryMap::<CfgId, Mark>::with_capacity(self.cfgs.len());
        for root in self.cfgs.keys() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(CfgId, Vec<CfgId>)> = Vec::new();
            marks[root] = Mark::Active;
            stack.push((root, self.cfgs[root].callees().collect()));
            while let Some((caller, callees)) = stack.last_mut() {
                let caller = *caller;
                let Some(callee) = callees.pop() else {
                    marks[caller] = Mark::Done;
                    stack.pop();
                    continue;
                };
                if !self.cfgs.is_valid(callee) {
                    return Err(CfgError::UnknownCallee {
                        caller: String::from(self.cfgs[caller].name()),
                        callee,
                    });
                }
                match marks[callee] {
                    Mark::Active => {
                        return Err(CfgError::Recursive(String::from(self.cfgs[callee].name())));
                    }
                    Mark::Done => continue,
                    Mark::Unvisited => {
                        marks[callee] = Mark::Active;
                        stack.push((callee, self.cfgs[callee].callees().collect()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("entry", &self.entry)
            .field("cfgs", &self.cfgs.values().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CfgBuilder;

    fn calling(name: &str, callee: Option<CfgId>) -> Cfg {
        let mut builder = CfgBuilder::new(name);
        let entry = builder.entry();
        let exit = builder.exit();
        let body = builder.add_block(0x1000, 16);
        builder.add_edge(entry, body);
        match callee {
            Some(callee) => {
                let call = builder.add_call(callee);
                builder.add_edge(body, call);
                builder.add_edge(call, exit);
            }
            None => {
                builder.add_edge(body, exit);
            }
        }
        builder.build().unwrap()
    }

    #[test]
    fn calls_between_declared_cfgs() {
        let mut builder = ProgramBuilder::new();
        let main = builder.declare("main");
        let leaf = builder.declare("leaf");
        builder.define(main, calling("main", Some(leaf)));
        builder.define(leaf, calling("leaf", None));
        let program = builder.build(main).unwrap();

        assert_eq!(program.entry(), main);
        assert_eq!(program.cfg(main).callees().collect::<Vec<_>>(), &[leaf]);
        assert_eq!(program.blocks().count(), 4 + 3);
        assert!(program.blocks().all(|block| program.contains(block)));
        assert!(!program.contains(BlockRef::new(leaf, BlockId::new(3))));
        assert!(!program.contains(BlockRef::new(CfgId::new(2), BlockId::new(0))));
    }

    #[test]
    fn recursion_is_rejected() {
        let mut builder = ProgramBuilder::new();
        let even = builder.declare("even");
        let odd = builder.declare("odd");
        builder.define(even, calling("even", Some(odd)));
        builder.define(odd, calling("odd", Some(even)));

        assert!(matches!(builder.build(even), Err(CfgError::Recursive(_))));
    }

    #[test]
    fn undefined_cfgs_are_rejected() {
        let mut builder = ProgramBuilder::new();
        let main = builder.declare("main");
        let missing = builder.declare("missing");
        builder.define(main, calling("main", Some(missing)));

        assert_eq!(builder.build(main).unwrap_err(), CfgError::Undefined(missing));
    }
}
