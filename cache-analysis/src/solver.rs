use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use cranelift_entity::SecondaryMap;
use wcet_cfg::{BlockId, BlockKind, BlockRef, Cfg, CfgId, EdgeId, Program};

use crate::{AnalysisError, CacheAnalysisConfig, CacheDomain, Context, FxHashMap};

/// A flag shared between an analysis run and its controller, used to abandon the run.
///
/// The engine polls the flag before visiting each block. Once it is set, the run stops with
/// [AnalysisError::Cancelled] and produces no result.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The traversal options of the [FixPoint] engine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixPointConfig {
    /// Join the states leaving a loop over all of its iterations, instead of keeping those of the
    /// last one. Both coincide for domains whose transfer functions are monotonic.
    pub pseudo_unrolling: bool,
    /// The number of iterations of a loop after which the engine gives up
    pub max_loop_iterations: usize,
}

impl Default for FixPointConfig {
    fn default() -> Self {
        Self::from(&CacheAnalysisConfig::default())
    }
}

impl From<&CacheAnalysisConfig> for FixPointConfig {
    fn from(config: &CacheAnalysisConfig) -> Self {
        Self {
            pseudo_unrolling: config.is_pseudo_unrolling(),
            max_loop_iterations: config.max_loop_iterations(),
        }
    }
}

/// The state entering each block of a program, joined over all the visits of the block.
///
/// A block which was never visited, because it is unreachable from the task entry, has no state.
#[derive(Debug, Clone)]
pub struct BlockStates<S> {
    states: FxHashMap<BlockRef, S>,
}

impl<S> Default for BlockStates<S> {
    fn default() -> Self {
        Self {
            states: FxHashMap::default(),
        }
    }
}

impl<S> BlockStates<S> {
    #[inline]
    pub fn get(&self, block: BlockRef) -> Option<&S> {
        self.states.get(&block)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockRef, &S)> + '_ {
        self.states.iter().map(|(block, state)| (*block, state))
    }
}

impl<S> FromIterator<(BlockRef, S)> for BlockStates<S> {
    fn from_iter<I: IntoIterator<Item = (BlockRef, S)>>(iter: I) -> Self {
        Self {
            states: iter.into_iter().collect(),
        }
    }
}

/// The states computed for the edges of the CFG being analyzed
struct Frame<S: Clone> {
    cfg: CfgId,
    /// The state flowing along each edge, once computed
    marks: SecondaryMap<EdgeId, Option<S>>,
}

/// Drives a [CacheDomain] to a fixpoint over a [Program].
///
/// The engine performs a structured traversal of each reducible CFG, in reverse post-order,
/// where each loop is iterated as a unit until its header state stabilizes:
///
/// * The first time a loop header is visited, its state is the join of the states reaching it
///   through its entry edges, so that the first iteration is analyzed on its own.
/// * On each following iteration, its state is the [CacheDomain::widening] of its previous state
///   with the join of the states reaching it through its back edges, until it no longer changes.
///
/// Calls are analyzed in place: the callee is traversed from its entry with the state of the
/// call block, and its exit state flows out of the call block. The call graph must be acyclic,
/// which [Program] guarantees.
///
/// Every state a block is entered with is joined into its snapshot, and the snapshots of all
/// blocks are the result of the analysis.
pub struct FixPoint<'a, D: CacheDomain> {
    domain: &'a D,
    program: &'a Program,
    config: FixPointConfig,
    cancellation: Option<CancellationToken>,
    snapshots: BlockStates<D::State>,
}

impl<'a, D: CacheDomain> FixPoint<'a, D> {
    pub fn new(domain: &'a D, program: &'a Program, config: FixPointConfig) -> Self {
        Self {
            domain,
            program,
            config,
            cancellation: None,
            snapshots: BlockStates::default(),
        }
    }

    /// Abandon the analysis as soon as `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Analyze the program from the entry of its task, returning the state entering each block
    pub fn run(mut self) -> Result<BlockStates<D::State>, AnalysisError> {
        log::debug!(target: "cache-solver", "running {} to fixpoint", self.domain.debug_name());
        let entry = self.domain.entry();
        self.analyze_cfg(self.program.entry(), entry)?;
        log::debug!(
            target: "cache-solver",
            "{} converged, {} block(s) reached",
            self.domain.debug_name(),
            self.snapshots.len()
        );
        Ok(self.snapshots)
    }

    /// Analyze `id` starting from `input`, returning the state at its exit, if it is reachable.
    fn analyze_cfg(
        &mut self,
        id: CfgId,
        input: D::State,
    ) -> Result<Option<D::State>, AnalysisError> {
        let program = self.program;
        let cfg = program.cfg(id);
        log::trace!(target: "cache-solver", "entering '{}'", cfg.name());

        let mut frame = Frame {
            cfg: id,
            marks: SecondaryMap::with_capacity(cfg.edges().len()),
        };
        let exit = self.analyze_region(&mut frame, None, cfg.entry(), input)?;

        log::trace!(target: "cache-solver", "leaving '{}'", cfg.name());
        Ok(exit)
    }

    /// Analyze the blocks of the loop headed by `header`, or of the whole CFG when `header` is
    /// `None`, seeding `seed` with `input`. Nested loops are analyzed as units.
    ///
    /// Returns the state the exit block of the CFG was visited with, if it was.
    fn analyze_region(
        &mut self,
        frame: &mut Frame<D::State>,
        header: Option<BlockId>,
        seed: BlockId,
        input: D::State,
    ) -> Result<Option<D::State>, AnalysisError> {
        let program = self.program;
        let cfg = program.cfg(frame.cfg);
        let mut input = Some(input);
        let mut exit = None;
        for block in cfg.reverse_post_order().iter().copied() {
            if header.is_some_and(|header| !cfg.loops().contains(header, block)) {
                continue;
            }
            match child_loop(cfg, header, block) {
                Some(child) if child == block => {
                    self.analyze_loop(frame, block)?;
                    continue;
                }
                Some(_) => continue,
                None => (),
            }

            let state = if block == seed {
                input.take()
            } else {
                self.join_predecessors(cfg, frame, block)
            };
            let Some(state) = state else {
                continue;
            };
            let out = self.visit(frame.cfg, cfg, block, &state)?;
            if block == cfg.exit() {
                exit = Some(state);
            }
            if let Some(out) = out {
                for edge in cfg.succs(block).iter().copied() {
                    self.propagate(frame, cfg, edge, &out);
                }
            }
        }
        Ok(exit)
    }

    /// Iterate the loop headed by `header` until its header state is stable
    fn analyze_loop(
        &mut self,
        frame: &mut Frame<D::State>,
        header: BlockId,
    ) -> Result<(), AnalysisError> {
        let program = self.program;
        let cfg = program.cfg(frame.cfg);
        let header_ref = BlockRef::new(frame.cfg, header);

        // First iteration: the loop is entered through its entry edges only
        let Some(mut state) = self.join_edges(
            frame,
            cfg.preds(header).iter().copied().filter(|edge| !cfg.is_back_edge(*edge)),
        ) else {
            return Ok(());
        };

        for edge in cfg.edges().map(|(edge, _)| edge) {
            if cfg.loop_exits(edge).any(|exited| exited == header) {
                frame.marks[edge] = None;
            }
        }

        let back_edges = cfg
            .preds(header)
            .iter()
            .copied()
            .filter(|edge| cfg.is_back_edge(*edge))
            .collect::<smallvec::SmallVec<[EdgeId; 2]>>();

        let mut iterations = 0;
        loop {
            iterations += 1;
            if iterations > self.config.max_loop_iterations {
                log::warn!(
                    target: "cache-solver",
                    "{} did not converge on loop {header_ref} after {} iterations",
                    self.domain.debug_name(),
                    self.config.max_loop_iterations
                );
                return Err(AnalysisError::NoFixpoint {
                    header: header_ref,
                    iterations: self.config.max_loop_iterations,
                });
            }
            log::trace!(
                target: self.domain.debug_name(),
                "iteration {iterations} of loop {header_ref}: {state:?}"
            );

            for edge in back_edges.iter().copied() {
                frame.marks[edge] = None;
            }
            self.analyze_region(frame, Some(header), header, state.clone())?;

            let Some(back) = self.join_edges(frame, back_edges.iter().copied()) else {
                // The loop body never iterates
                break;
            };
            if !self.domain.widening(&mut state, &back).changed() {
                break;
            }
        }

        log::trace!(
            target: "cache-solver",
            "loop {header_ref} converged after {iterations} iteration(s)"
        );
        Ok(())
    }

    /// Record `input` in the snapshot of `block`, and compute the state leaving it.
    ///
    /// Returns `None` if the block never completes, i.e. it calls a function which never returns.
    fn visit(
        &mut self,
        id: CfgId,
        cfg: &Cfg,
        block: BlockId,
        input: &D::State,
    ) -> Result<Option<D::State>, AnalysisError> {
        if self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled) {
            log::debug!(target: "cache-solver", "analysis cancelled");
            return Err(AnalysisError::Cancelled);
        }

        let block_ref = BlockRef::new(id, block);
        match self.snapshots.states.get_mut(&block_ref) {
            Some(snapshot) => {
                self.domain.lub(snapshot, input);
            }
            None => {
                self.snapshots.states.insert(block_ref, input.clone());
            }
        }

        match cfg.block(block).kind {
            BlockKind::Call(callee) => {
                let mut state = input.clone();
                self.domain.enter_context(&mut state, block_ref, Context::Call);
                let Some(mut out) = self.analyze_cfg(callee, state)? else {
                    return Ok(None);
                };
                self.domain.leave_context(&mut out, block_ref, Context::Call);
                Ok(Some(out))
            }
            BlockKind::Entry | BlockKind::Exit | BlockKind::Basic => {
                let mut out = self.domain.bottom();
                self.domain.update(&mut out, input, block_ref);
                log::trace!(target: self.domain.debug_name(), "{block_ref}: {input:?} => {out:?}");
                Ok(Some(out))
            }
        }
    }

    /// Transfer `state` along `edge`, leaving and entering loop contexts as required
    fn propagate(&self, frame: &mut Frame<D::State>, cfg: &Cfg, edge: EdgeId, state: &D::State) {
        let mut state = state.clone();
        let mut exits_loop = false;
        for header in cfg.loop_exits(edge) {
            self.domain.leave_context(&mut state, BlockRef::new(frame.cfg, header), Context::Loop);
            exits_loop = true;
        }
        if let Some(header) = cfg.loop_entry(edge) {
            self.domain.enter_context(&mut state, BlockRef::new(frame.cfg, header), Context::Loop);
        }

        match frame.marks[edge].as_mut() {
            Some(mark) if exits_loop && self.config.pseudo_unrolling => {
                self.domain.lub(mark, &state);
            }
            Some(mark) => self.domain.assign(mark, &state),
            None => frame.marks[edge] = Some(state),
        }
    }

    /// Join the states reaching `block` through its incoming edges
    fn join_predecessors(
        &self,
        cfg: &Cfg,
        frame: &Frame<D::State>,
        block: BlockId,
    ) -> Option<D::State> {
        self.join_edges(frame, cfg.preds(block).iter().copied())
    }

    fn join_edges(
        &self,
        frame: &Frame<D::State>,
        edges: impl IntoIterator<Item = EdgeId>,
    ) -> Option<D::State> {
        let mut joined: Option<D::State> = None;
        for edge in edges {
            let Some(mark) = frame.marks[edge].as_ref() else {
                continue;
            };
            match joined.as_mut() {
                Some(state) => {
                    self.domain.lub(state, mark);
                }
                None => joined = Some(mark.clone()),
            }
        }
        joined
    }
}

/// Get the header of the outermost loop containing `block` which is nested in the loop headed by
/// `region`, or in no loop at all when `region` is `None`.
fn child_loop(cfg: &Cfg, region: Option<BlockId>, block: BlockId) -> Option<BlockId> {
    let mut child = None;
    for header in cfg.loops().containing(block) {
        if Some(header) == region {
            break;
        }
        child = Some(header);
    }
    child
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use pretty_assertions::assert_eq;
    use wcet_cfg::{CfgBuilder, ProgramBuilder};

    use super::*;
    use crate::LatticeLike;

    /// The blocks a path may have executed since the task started
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Trace(Vec<BlockRef>);

    impl LatticeLike for Trace {
        fn join(&self, other: &Self) -> Self {
            let mut blocks = self.0.clone();
            blocks.extend(other.0.iter().copied());
            blocks.sort();
            blocks.dedup();
            Trace(blocks)
        }
    }

    #[derive(Default)]
    struct TraceDomain {
        contexts: RefCell<Vec<(BlockRef, Context, bool)>>,
    }

    impl CacheDomain for TraceDomain {
        type State = Trace;

        fn debug_name(&self) -> &'static str {
            "trace"
        }

        fn bottom(&self) -> Self::State {
            Trace(Vec::new())
        }

        fn entry(&self) -> Self::State {
            Trace(Vec::new())
        }

        fn update(&self, out: &mut Self::State, input: &Self::State, block: BlockRef) {
            *out = input.join(&Trace(alloc::vec![block]));
        }

        fn enter_context(&self, _state: &mut Self::State, block: BlockRef, context: Context) {
            self.contexts.borrow_mut().push((block, context, true));
        }

        fn leave_context(&self, _state: &mut Self::State, block: BlockRef, context: Context) {
            self.contexts.borrow_mut().push((block, context, false));
        }
    }

    /// entry -> a -> h -> b -> h, h -> exit
    fn single_loop() -> (Program, [BlockId; 5]) {
        let mut builder = CfgBuilder::new("loop");
        let entry = builder.entry();
        let exit = builder.exit();
        let a = builder.add_block(0x0, 4);
        let h = builder.add_block(0x4, 4);
        let b = builder.add_block(0x8, 4);
        builder.add_edge(entry, a);
        builder.add_edge(a, h);
        builder.add_edge(h, b);
        builder.add_edge(b, h);
        builder.add_edge(h, exit);
        let program = Program::from_cfg(builder.build().unwrap()).unwrap();
        (program, [entry, a, h, b, exit])
    }

    #[test]
    fn loops_iterate_until_stable() {
        let (program, [entry, a, h, b, exit]) = single_loop();
        let cfg = program.entry();
        let at = |block| BlockRef::new(cfg, block);
        let domain = TraceDomain::default();
        let states = FixPoint::new(&domain, &program, FixPointConfig::default()).run().unwrap();

        assert_eq!(states.get(at(a)).unwrap().0, &[at(entry)]);
        // The header is first entered from `a`, then from the back edge
        assert_eq!(states.get(at(h)).unwrap().0, &[at(entry), at(a), at(h), at(b)]);
        assert_eq!(states.get(at(exit)).unwrap().0, &[at(entry), at(a), at(h), at(b)]);

        let contexts = domain.contexts.borrow();
        assert_eq!(contexts.first(), Some(&(at(h), Context::Loop, true)));
        assert_eq!(contexts.last(), Some(&(at(h), Context::Loop, false)));
        assert_eq!(contexts.iter().filter(|(_, _, enter)| *enter).count(), 1);
    }

    #[test]
    fn calls_are_analyzed_in_place() {
        let mut builder = ProgramBuilder::new();
        let main = builder.declare("main");
        let leaf = builder.declare("leaf");

        let mut cfg = CfgBuilder::new("main");
        let (entry, exit) = (cfg.entry(), cfg.exit());
        let call = cfg.add_call(leaf);
        let after = cfg.add_block(0x10, 4);
        cfg.add_edge(entry, call);
        cfg.add_edge(call, after);
        cfg.add_edge(after, exit);
        builder.define(main, cfg.build().unwrap());

        let mut cfg = CfgBuilder::new("leaf");
        let (leaf_entry, leaf_exit) = (cfg.entry(), cfg.exit());
        let body = cfg.add_block(0x100, 4);
        cfg.add_edge(leaf_entry, body);
        cfg.add_edge(body, leaf_exit);
        builder.define(leaf, cfg.build().unwrap());

        let program = builder.build(main).unwrap();
        let domain = TraceDomain::default();
        let states = FixPoint::new(&domain, &program, FixPointConfig::default()).run().unwrap();

        // The blocks of the callee flow into the caller
        assert_eq!(
            states.get(BlockRef::new(main, after)).unwrap().0,
            &[
                BlockRef::new(main, entry),
                BlockRef::new(leaf, leaf_entry),
                BlockRef::new(leaf, body),
            ]
        );
        assert!(states.get(BlockRef::new(leaf, leaf_exit)).is_some());
        assert_eq!(
            domain.contexts.borrow().as_slice(),
            &[
                (BlockRef::new(main, call), Context::Call, true),
                (BlockRef::new(main, call), Context::Call, false),
            ]
        );
    }

    #[test]
    fn cancellation_aborts_the_run() {
        let (program, _) = single_loop();
        let domain = TraceDomain::default();
        let token = CancellationToken::new();
        token.cancel();
        let result = FixPoint::new(&domain, &program, FixPointConfig::default())
            .with_cancellation(token)
            .run();
        assert_eq!(result.unwrap_err(), AnalysisError::Cancelled);
    }

    /// Wraps around once its value reaches 4, which makes the state leaving the loop header smaller
    /// on the second iteration than on the first
    #[test]
    fn pseudo_unrolling_joins_the_exits_of_every_iteration() {
        #[derive(Debug, Clone, PartialEq, Eq)]
        struct Counter(u32);

        impl LatticeLike for Counter {
            fn join(&self, other: &Self) -> Self {
                Counter(self.0.max(other.0))
            }
        }

        struct Wrapping;

        impl CacheDomain for Wrapping {
            type State = Counter;

            fn debug_name(&self) -> &'static str {
                "wrapping"
            }

            fn bottom(&self) -> Self::State {
                Counter(0)
            }

            fn entry(&self) -> Self::State {
                Counter(0)
            }

            fn update(&self, out: &mut Self::State, input: &Self::State, _block: BlockRef) {
                *out = Counter(if input.0 >= 4 { 0 } else { input.0 + 1 });
            }
        }

        let (program, [_, _, h, _, exit]) = single_loop();
        let at = |block| BlockRef::new(program.entry(), block);
        let exit_state = |pseudo_unrolling| {
            let config = FixPointConfig {
                pseudo_unrolling,
                max_loop_iterations: 8,
            };
            let states = FixPoint::new(&Wrapping, &program, config).run().unwrap();
            assert_eq!(states.get(at(h)), Some(&Counter(4)));
            states.get(at(exit)).cloned()
        };

        assert_eq!(exit_state(true), Some(Counter(3)));
        assert_eq!(exit_state(false), Some(Counter(0)));
    }

    #[test]
    fn pseudo_unrolling_is_transparent_to_monotonic_domains() {
        let (program, _) = single_loop();
        let run = |pseudo_unrolling| {
            let config = FixPointConfig {
                pseudo_unrolling,
                max_loop_iterations: 8,
            };
            let domain = TraceDomain::default();
            let states = FixPoint::new(&domain, &program, config).run().unwrap();
            let mut states = states.iter().map(|(b, s)| (b, s.clone())).collect::<Vec<_>>();
            states.sort_by_key(|(block, _)| *block);
            states
        };

        assert_eq!(run(true), run(false));
    }

    /// A domain whose states grow forever never converges
    #[test]
    fn diverging_loops_are_reported() {
        #[derive(Debug, Clone, PartialEq, Eq)]
        struct Counter(u32);

        impl LatticeLike for Counter {
            fn join(&self, other: &Self) -> Self {
                Counter(self.0.max(other.0))
            }
        }

        struct Diverging;

        impl CacheDomain for Diverging {
            type State = Counter;

            fn debug_name(&self) -> &'static str {
                "diverging"
            }

            fn bottom(&self) -> Self::State {
                Counter(0)
            }

            fn entry(&self) -> Self::State {
                Counter(0)
            }

            fn update(&self, out: &mut Self::State, input: &Self::State, _block: BlockRef) {
                *out = Counter(input.0 + 1);
            }
        }

        let (program, [_, _, h, _, _]) = single_loop();
        let config = FixPointConfig {
            pseudo_unrolling: true,
            max_loop_iterations: 8,
        };
        let result = FixPoint::new(&Diverging, &program, config).run();
        assert_eq!(
            result.unwrap_err(),
            AnalysisError::NoFixpoint {
                header: BlockRef::new(program.entry(), h),
                iterations: 8,
            }
        );
    }
}
