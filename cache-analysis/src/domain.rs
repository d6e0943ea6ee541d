use core::fmt;

use wcet_cfg::BlockRef;

use crate::{ChangeResult, LatticeLike};

/// The kind of scope the fixpoint engine enters or leaves
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Context {
    /// A call block transfers control to another CFG, which is analyzed in place
    Call,
    /// A loop is entered through one of its entry edges, or left through one of its exits
    Loop,
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => f.write_str("call"),
            Self::Loop => f.write_str("loop"),
        }
    }
}

/// The contract between an abstract cache domain and the [crate::FixPoint] engine driving it.
///
/// A domain owns no state of its own beyond its configuration: the engine allocates states,
/// stores them on edges, and asks the domain to combine and transform them. This mirrors the
/// hooks of a classical interprocedural abstract interpreter:
///
/// * [CacheDomain::entry] is the state at the start of the analyzed task
/// * [CacheDomain::update] is the transfer function of a block
/// * [CacheDomain::lub] merges states at control-flow joins
/// * [CacheDomain::widening] combines the state of a loop header with the states coming back from
///   the loop body, on every iteration after the first
/// * [CacheDomain::enter_context] and [CacheDomain::leave_context] are invoked when a loop or a
///   call is entered or left, allowing per-scope state to be pushed and popped
///
/// The domains are selected statically by the caller; the engine is generic over this trait.
pub trait CacheDomain {
    type State: LatticeLike;

    /// The name of this domain, used as log target
    fn debug_name(&self) -> &'static str;

    /// The state describing no execution at all
    fn bottom(&self) -> Self::State;

    /// The state at the start of the analyzed task
    fn entry(&self) -> Self::State;

    /// Joins `other` into `state`
    fn lub(&self, state: &mut Self::State, other: &Self::State) -> ChangeResult {
        state.join_in_place(other)
    }

    fn assign(&self, state: &mut Self::State, other: &Self::State) {
        state.clone_from(other);
    }

    fn equals(&self, a: &Self::State, b: &Self::State) -> bool {
        a == b
    }

    /// Compute in `out` the state after executing `block`, starting from `input`
    fn update(&self, out: &mut Self::State, input: &Self::State, block: BlockRef);

    /// Invoked on `state` when the engine enters `context`, identified by the loop header or call
    /// block `block`.
    fn enter_context(&self, state: &mut Self::State, block: BlockRef, context: Context) {
        let _ = (state, block, context);
    }

    /// Invoked on `state` when the engine leaves the `context` previously entered at `block`
    fn leave_context(&self, state: &mut Self::State, block: BlockRef, context: Context) {
        let _ = (state, block, context);
    }

    /// Combine the state of a loop header with the join of the states reaching it through its
    /// back edges, reporting whether [CacheDomain::equals] tells the result apart from `state`.
    ///
    /// The result must be greater than or equal to `state`, so that iterations are monotonic.
    fn widening(&self, state: &mut Self::State, back_edges: &Self::State) -> ChangeResult {
        let widened = state.join(back_edges);
        let change = ChangeResult::from(!self.equals(&widened, state));
        *state = widened;
        change
    }
}
