use wcet_cfg::{BlockRef, CfgError};

use crate::CacheKind;

/// Errors which prevent a cache analysis run from producing any result.
///
/// None of these are recoverable within a run: when one is returned, no category computed so far
/// is published.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("no program was provided to the cache analysis")]
    MissingProgram,
    #[error("the platform has no {0} cache")]
    MissingCache(CacheKind),
    #[error("no memory access information was provided for the {0} cache")]
    MissingAccesses(CacheKind),
    #[error("invalid cache geometry: {0}")]
    InvalidCache(&'static str),
    #[error("access table refers to {0}, which is not a block of the analyzed program")]
    UnknownBlock(BlockRef),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("cache analysis was cancelled")]
    Cancelled,
    #[error("loop headed by {header} did not reach a fixpoint after {iterations} iterations")]
    NoFixpoint { header: BlockRef, iterations: usize },
}
