use core::fmt;

use wcet_cfg::Address;

use crate::{AnalysisError, CacheKind, SetId};

/// The largest associativity the abstract domains can represent.
///
/// Ages are encoded on a byte, and the persistence domain needs one extra age past the
/// associativity to mark evicted blocks.
pub const MAX_ASSOCIATIVITY: usize = 64;

/// The replacement policy of a cache.
///
/// Only LRU is analyzable by the abstract domains of this crate.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReplacementPolicy {
    #[default]
    Lru,
}

/// The geometry of a set-associative cache
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheConfig {
    associativity: usize,
    set_count: usize,
    block_size: usize,
    replacement: ReplacementPolicy,
}

impl CacheConfig {
    /// Describe an LRU cache with `set_count` sets of `associativity` ways, each holding
    /// `block_size` bytes.
    pub fn new(
        associativity: usize,
        set_count: usize,
        block_size: usize,
    ) -> Result<Self, AnalysisError> {
        if associativity == 0 {
            return Err(AnalysisError::InvalidCache("associativity must be non-zero"));
        }
        if associativity > MAX_ASSOCIATIVITY {
            return Err(AnalysisError::InvalidCache("associativity is too large"));
        }
        if !set_count.is_power_of_two() {
            return Err(AnalysisError::InvalidCache("set count must be a power of two"));
        }
        if !block_size.is_power_of_two() {
            return Err(AnalysisError::InvalidCache("block size must be a power of two"));
        }
        Ok(Self {
            associativity,
            set_count,
            block_size,
            replacement: ReplacementPolicy::Lru,
        })
    }

    /// The number of ways of each set, usually named `A`
    #[inline(always)]
    pub const fn associativity(&self) -> usize {
        self.associativity
    }

    #[inline(always)]
    pub const fn set_count(&self) -> usize {
        self.set_count
    }

    #[inline(always)]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline(always)]
    pub const fn replacement(&self) -> ReplacementPolicy {
        self.replacement
    }

    /// The total capacity of the cache, in bytes
    pub const fn size(&self) -> usize {
        self.associativity * self.set_count * self.block_size
    }

    #[inline]
    fn block_bits(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    #[inline]
    fn set_bits(&self) -> u32 {
        self.set_count.trailing_zeros()
    }

    /// The memory block number holding `address`
    #[inline]
    pub fn block_of(&self, address: Address) -> Address {
        address >> self.block_bits()
    }

    /// The address of the first byte of memory block number `block`
    #[inline]
    pub fn block_address(&self, block: Address) -> Address {
        block << self.block_bits()
    }

    /// The set `address` is mapped to
    #[inline]
    pub fn set_of(&self, address: Address) -> SetId {
        let mask = (self.set_count - 1) as Address;
        SetId::from_u32((self.block_of(address) & mask) as u32)
    }

    #[inline]
    pub fn tag_of(&self, address: Address) -> Address {
        address >> (self.block_bits() + self.set_bits())
    }

    /// The address of the first byte of the memory block holding `address`
    #[inline]
    pub fn base_of(&self, address: Address) -> Address {
        address & !((self.block_size - 1) as Address)
    }
}

impl fmt::Display for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-way, {} sets of {} bytes ({:?})",
            self.associativity, self.set_count, self.block_size, self.replacement
        )
    }
}

/// The memory hierarchy of the target, as far as the cache analyses are concerned
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Platform {
    pub instruction_cache: Option<CacheConfig>,
    pub data_cache: Option<CacheConfig>,
}

impl Platform {
    pub fn with_instruction_cache(mut self, cache: CacheConfig) -> Self {
        self.instruction_cache = Some(cache);
        self
    }

    pub fn with_data_cache(mut self, cache: CacheConfig) -> Self {
        self.data_cache = Some(cache);
        self
    }

    /// Get the description of the cache of the given kind, if the platform has one
    pub fn cache(&self, kind: CacheKind) -> Option<&CacheConfig> {
        match kind {
            CacheKind::Instruction => self.instruction_cache.as_ref(),
            CacheKind::Data => self.data_cache.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_decomposition() {
        // 4 sets of 16 bytes
        let cache = CacheConfig::new(2, 4, 16).unwrap();
        assert_eq!(cache.size(), 128);
        assert_eq!(cache.block_of(0x1234), 0x123);
        assert_eq!(cache.set_of(0x1234), SetId::from_u32(3));
        assert_eq!(cache.tag_of(0x1234), 0x48);
        assert_eq!(cache.base_of(0x1234), 0x1230);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        assert!(CacheConfig::new(0, 4, 16).is_err());
        assert!(CacheConfig::new(MAX_ASSOCIATIVITY + 1, 4, 16).is_err());
        assert!(CacheConfig::new(2, 3, 16).is_err());
        assert!(CacheConfig::new(2, 4, 0).is_err());
    }

    #[test]
    fn platform_selects_cache_by_kind() {
        let icache = CacheConfig::new(4, 16, 32).unwrap();
        let platform = Platform::default().with_instruction_cache(icache);
        assert_eq!(platform.cache(CacheKind::Instruction), Some(&icache));
        assert_eq!(platform.cache(CacheKind::Data), None);
    }
}
