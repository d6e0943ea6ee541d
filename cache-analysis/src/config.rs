use core::{fmt, str::FromStr};

/// Raised when parsing a configuration option from a string fails
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidOptionError {
    #[error("invalid persistence mode: expected 'none', 'inner', 'outer' or 'multi'")]
    PersistenceMode,
    #[error("invalid cache kind: expected 'instruction', 'icache', 'data' or 'dcache'")]
    CacheKind,
}

/// How first-miss (persistence) categories are computed.
///
/// With loop nests, a block may be persistent in an inner loop without being persistent in the
/// enclosing ones. The mode selects which loop level a [crate::Category::FirstMiss] refers to.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PersistenceMode {
    /// Persistence analysis is disabled, no access is ever categorized as first-miss
    #[default]
    None,
    /// Persistence with respect to the innermost enclosing loop only
    Inner,
    /// Persistence with respect to the outermost enclosing loop
    Outer,
    /// Persistence with respect to the outermost loop level at which the block is persistent
    Multi,
}

impl PersistenceMode {
    #[inline]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Inner => "inner",
            Self::Outer => "outer",
            Self::Multi => "multi",
        })
    }
}

impl FromStr for PersistenceMode {
    type Err = InvalidOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "inner" => Ok(Self::Inner),
            "outer" => Ok(Self::Outer),
            "multi" => Ok(Self::Multi),
            _ => Err(InvalidOptionError::PersistenceMode),
        }
    }
}

/// Which cache of the platform is analyzed
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CacheKind {
    #[default]
    Instruction,
    Data,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Instruction => "instruction",
            Self::Data => "data",
        })
    }
}

impl FromStr for CacheKind {
    type Err = InvalidOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instruction" | "icache" => Ok(Self::Instruction),
            "data" | "dcache" => Ok(Self::Data),
            _ => Err(InvalidOptionError::CacheKind),
        }
    }
}

/// Configuration for the cache analyses and the categorization of accesses.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheAnalysisConfig {
    /// The cache of the platform being analyzed
    cache: CacheKind,
    /// Which loop level first-miss categories refer to, if any
    persistence: PersistenceMode,
    /// Whether the MAY analysis runs, to prove misses
    may_analysis: bool,
    /// Whether the dirty-line analysis of write-back caches runs
    dirty_analysis: bool,
    /// Whether the fixpoint engine keeps the first iteration of loops apart
    pseudo_unrolling: bool,
    /// Upper bound on the number of iterations of a loop before giving up on convergence
    max_loop_iterations: usize,
}

impl Default for CacheAnalysisConfig {
    fn default() -> Self {
        Self {
            cache: CacheKind::default(),
            persistence: PersistenceMode::default(),
            may_analysis: true,
            dirty_analysis: false,
            pseudo_unrolling: true,
            max_loop_iterations: 1024,
        }
    }
}

impl CacheAnalysisConfig {
    /// Get a new, default configuration
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub const fn cache(&self) -> CacheKind {
        self.cache
    }

    #[inline(always)]
    pub const fn persistence(&self) -> PersistenceMode {
        self.persistence
    }

    #[inline(always)]
    pub const fn is_may_analysis_enabled(&self) -> bool {
        self.may_analysis
    }

    #[inline(always)]
    pub const fn is_dirty_analysis_enabled(&self) -> bool {
        self.dirty_analysis
    }

    #[inline(always)]
    pub const fn is_pseudo_unrolling(&self) -> bool {
        self.pseudo_unrolling
    }

    #[inline(always)]
    pub const fn max_loop_iterations(&self) -> usize {
        self.max_loop_iterations
    }

    /// Select the cache of the platform to analyze
    pub fn set_cache(&mut self, cache: CacheKind) -> &mut Self {
        self.cache = cache;
        self
    }

    /// Set the persistence mode used to compute first-miss categories.
    ///
    /// [PersistenceMode::None] disables the persistence analysis altogether.
    pub fn set_persistence(&mut self, mode: PersistenceMode) -> &mut Self {
        self.persistence = mode;
        self
    }

    /// Set whether the MAY analysis should run.
    ///
    /// Without it, accesses that are not proven to hit (or to be persistent) are categorized as
    /// always-miss rather than not-classified.
    pub fn set_may_analysis(&mut self, yes: bool) -> &mut Self {
        self.may_analysis = yes;
        self
    }

    /// Set whether the dirty-line analysis should run, which only matters for write-back caches
    pub fn set_dirty_analysis(&mut self, yes: bool) -> &mut Self {
        self.dirty_analysis = yes;
        self
    }

    /// Set whether the first iteration of each loop is analyzed apart from the others.
    ///
    /// When enabled, the states leaving a loop join what every iteration produced, the first one
    /// included. Otherwise only the states of the converged iteration leave the loop.
    ///
    /// The transfer functions of the cache domains are monotonic, so the converged iteration
    /// already covers the earlier ones: this has no effect on the states entering blocks, nor on
    /// the categories. It only matters to domains plugged into [crate::FixPoint] directly.
    pub fn set_pseudo_unrolling(&mut self, yes: bool) -> &mut Self {
        self.pseudo_unrolling = yes;
        self
    }

    /// Set the number of iterations after which a loop that has not converged is reported as an
    /// error.
    pub fn set_max_loop_iterations(&mut self, limit: usize) -> &mut Self {
        self.max_loop_iterations = limit;
        self
    }
}
