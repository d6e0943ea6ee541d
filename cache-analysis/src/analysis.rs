use wcet_cfg::Program;

use crate::{
    AccessId, AccessTable, AnalysisError, BlockStates, CacheAnalysisConfig, CacheConfig,
    CacheDomain, CacheKind, CacheSetCatalog, CancellationToken, Catalog, CatalogBuilder,
    Categories, CategoryBuilder, CategoryInfo, CategoryStats, DirtyDomain, DirtyState, FixPoint,
    FixPointConfig, FxHashMap, MayDomain, MayState, MustDomain, MustState, PersDomain, PersState,
    Platform, SetId,
};

/// The converged states entering each block, for one cache set.
///
/// The MAY, persistence and dirty-line states are only computed when the configuration enables
/// the corresponding analysis.
#[derive(Debug, Clone)]
pub struct SetStates {
    pub must: BlockStates<MustState>,
    pub may: Option<BlockStates<MayState>>,
    pub pers: Option<BlockStates<PersState>>,
    pub dirty: Option<BlockStates<DirtyState>>,
}

/// Runs the cache analyses over a program, and categorizes its accesses.
///
/// The analysis requires a [Program], the [Platform] holding the cache selected by the
/// configuration, and the memory accesses of the program for this cache. The accesses of an
/// instruction cache are derived from the program itself when none are provided.
///
/// ```ignore
/// let platform = Platform::default().with_instruction_cache(CacheConfig::new(4, 64, 16)?);
/// let mut config = CacheAnalysisConfig::new();
/// config.set_persistence(PersistenceMode::Multi);
/// let results = CacheAnalysis::new(config)
///     .with_program(&program)
///     .with_platform(&platform)
///     .run()?;
/// log::info!("{}", results.stats());
/// ```
pub struct CacheAnalysis<'a> {
    config: CacheAnalysisConfig,
    program: Option<&'a Program>,
    platform: Option<&'a Platform>,
    accesses: Option<(Catalog, AccessTable)>,
    cancellation: Option<CancellationToken>,
}

impl<'a> CacheAnalysis<'a> {
    pub fn new(config: CacheAnalysisConfig) -> Self {
        Self {
            config,
            program: None,
            platform: None,
            accesses: None,
            cancellation: None,
        }
    }

    #[inline(always)]
    pub const fn config(&self) -> &CacheAnalysisConfig {
        &self.config
    }

    pub fn with_program(mut self, program: &'a Program) -> Self {
        self.program = Some(program);
        self
    }

    pub fn with_platform(mut self, platform: &'a Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Provide the memory accesses of the program, as recorded by a [CatalogBuilder] for the
    /// analyzed cache
    pub fn with_accesses(mut self, catalog: Catalog, accesses: AccessTable) -> Self {
        self.accesses = Some((catalog, accesses));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Run every enabled analysis on each cache set, then categorize the accesses.
    ///
    /// Nothing is returned unless the whole run succeeds.
    pub fn run(&self) -> Result<CacheAnalysisResults, AnalysisError> {
        let program = self.program.ok_or(AnalysisError::MissingProgram)?;
        let kind = self.config.cache();
        let cache = self
            .platform
            .and_then(|platform| platform.cache(kind))
            .ok_or(AnalysisError::MissingCache(kind))?;
        program.validate()?;

        let (catalog, accesses) = match &self.accesses {
            Some((catalog, accesses)) => (catalog.clone(), accesses.clone()),
            None if kind == CacheKind::Instruction => {
                let mut builder = CatalogBuilder::new(*cache);
                builder.add_fetches(program);
                builder.finish()
            }
            None => return Err(AnalysisError::MissingAccesses(kind)),
        };
        if catalog.config() != cache {
            return Err(AnalysisError::InvalidCache(
                "the accesses were cataloged for another cache geometry",
            ));
        }
        if let Some(block) = accesses.blocks().find(|block| !program.contains(*block)) {
            return Err(AnalysisError::UnknownBlock(block));
        }

        log::debug!(target: "cache-analysis", "analyzing {kind} cache: {cache}");
        let mut sets = FxHashMap::default();
        for set in catalog.sets() {
            if set.real_len() == 0 {
                continue;
            }
            let states = self.analyze_set(program, cache, set, &accesses)?;
            sets.insert(set.id(), states);
        }
        if self.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let categories =
            CategoryBuilder::new(&self.config, program, &catalog, &accesses, &sets).build();
        log::debug!(target: "cache-analysis", "{kind} cache categories:\n{}", categories.stats());

        Ok(CacheAnalysisResults {
            catalog,
            accesses,
            sets,
            categories,
        })
    }

    fn analyze_set(
        &self,
        program: &Program,
        cache: &CacheConfig,
        set: &CacheSetCatalog,
        accesses: &AccessTable,
    ) -> Result<SetStates, AnalysisError> {
        let associativity = cache.associativity();
        log::debug!(
            target: "cache-analysis",
            "analyzing {} with {} block(s)",
            set.id(),
            set.real_len()
        );

        let must = self.fixpoint(&MustDomain::new(set, accesses, associativity), program)?;
        let may = if self.config.is_may_analysis_enabled() {
            Some(self.fixpoint(&MayDomain::new(set, accesses, associativity), program)?)
        } else {
            None
        };
        let pers = if self.config.persistence().is_enabled() {
            Some(self.fixpoint(&PersDomain::new(set, accesses, associativity), program)?)
        } else {
            None
        };
        let dirty = if self.config.is_dirty_analysis_enabled() {
            Some(self.fixpoint(&DirtyDomain::new(set, accesses, associativity), program)?)
        } else {
            None
        };

        Ok(SetStates {
            must,
            may,
            pers,
            dirty,
        })
    }

    fn fixpoint<D: CacheDomain>(
        &self,
        domain: &D,
        program: &Program,
    ) -> Result<BlockStates<D::State>, AnalysisError> {
        let mut engine = FixPoint::new(domain, program, FixPointConfig::from(&self.config));
        if let Some(token) = self.cancellation.as_ref() {
            engine = engine.with_cancellation(token.clone());
        }
        engine.run()
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Everything a successful [CacheAnalysis] run produced
#[derive(Debug, Clone)]
pub struct CacheAnalysisResults {
    catalog: Catalog,
    accesses: AccessTable,
    sets: FxHashMap<SetId, SetStates>,
    categories: Categories,
}

impl CacheAnalysisResults {
    #[inline(always)]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[inline(always)]
    pub const fn accesses(&self) -> &AccessTable {
        &self.accesses
    }

    /// Get the converged states of `set`, unless no block of the program maps to it
    pub fn set(&self, set: SetId) -> Option<&SetStates> {
        self.sets.get(&set)
    }

    #[inline(always)]
    pub const fn categories(&self) -> &Categories {
        &self.categories
    }

    #[inline]
    pub fn category(&self, access: AccessId) -> Option<CategoryInfo> {
        self.categories.get(access)
    }

    #[inline]
    pub fn stats(&self) -> &CategoryStats {
        self.categories.stats()
    }
}
