use thiserror::Error;

/// Default number of independent LRU shards (lock domains).
pub const DEFAULT_NUM_SHARDS: usize = 32;

/// Default hot/cold ratio: one in `DEFAULT_HOT_RATIO` list entries is hot.
pub const DEFAULT_HOT_RATIO: u32 = 5;

/// Default upper bound on lines handed to the cleaner in one pass.
pub const DEFAULT_CLEAN_BATCH: u32 = 32;

/// Default ceiling on lines mid-eviction across the whole cache.
pub const DEFAULT_PENDING_EVICTION_LIMIT: u32 = 512;

pub const SECTOR_SIZE: u64 = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cache must have at least one line")]
    ZeroLines,
    #[error("number of lines must be below the end-of-list sentinel")]
    TooManyLines,
    #[error("cache must have at least one shard")]
    ZeroShards,
    #[error("cache must have at least one hash bucket")]
    ZeroBuckets,
    #[error("hot ratio must be nonzero")]
    ZeroHotRatio,
    #[error("line size must be a nonzero multiple of the sector size")]
    BadLineSize,
    #[error("expected {expected} partition configs, got {got}")]
    PartCountMismatch { expected: usize, got: usize },
}

/// Geometry and tuning knobs of the replacement engine, validated by
/// [`Cache::try_new`](crate::Cache::try_new).
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Total number of cache lines.
    pub num_lines: u32,
    /// Number of LRU shards; a line's shard is `line % num_shards` for life.
    pub num_shards: usize,
    /// Number of user partitions (I/O classes), excluding the freelist.
    pub num_user_parts: u16,
    /// Number of backing cores (front-end volumes).
    pub num_cores: u16,
    /// Number of reverse-lookup hash buckets.
    pub num_hash_buckets: usize,
    /// Cache line size in bytes.
    pub line_size: u64,
    /// One in `hot_ratio` entries of a tracked list is kept hot.
    pub hot_ratio: u32,
    /// Upper bound on lines collected per cleaning pass.
    pub clean_batch: u32,
    /// Ceiling on concurrently pending evictions (backpressure).
    pub pending_eviction_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_lines: 1024,
            num_shards: DEFAULT_NUM_SHARDS,
            num_user_parts: 1,
            num_cores: 1,
            num_hash_buckets: 128,
            line_size: 4096,
            hot_ratio: DEFAULT_HOT_RATIO,
            clean_batch: DEFAULT_CLEAN_BATCH,
            pending_eviction_limit: DEFAULT_PENDING_EVICTION_LIMIT,
        }
    }
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.num_lines == 0 {
            return Err(ConfigError::ZeroLines);
        }
        if self.num_lines == u32::MAX {
            return Err(ConfigError::TooManyLines);
        }
        if self.num_shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if self.num_hash_buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        if self.hot_ratio == 0 {
            return Err(ConfigError::ZeroHotRatio);
        }
        if self.line_size == 0 || self.line_size % SECTOR_SIZE != 0 {
            return Err(ConfigError::BadLineSize);
        }
        Ok(())
    }

    /// Number of addressable sectors per line, capped at the width of the
    /// per-line valid bitmap.
    pub fn sectors_per_line(&self) -> u32 {
        ((self.line_size / SECTOR_SIZE) as u32).min(64)
    }
}
