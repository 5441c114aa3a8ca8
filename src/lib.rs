//! Line-replacement engine for a block cache: sharded approximate-LRU lists
//! with hot/cold clustering, quota partitions, multi-lock victim selection
//! and single-flight dirty-line cleaning.

mod actor;
mod cache;
mod cleaning;
mod concurrency;
mod config;
mod lru;
mod meta;
mod partition;
mod request;

pub use actor::{ScanError, ScanFilter};
pub use cache::{Cache, ManagementGuard};
pub use cleaning::{Cleaner, CleaningStatus};
pub use concurrency::{HashLocks, LineLocks};
pub use config::{
    CacheConfig, ConfigError, DEFAULT_CLEAN_BATCH, DEFAULT_HOT_RATIO, DEFAULT_NUM_SHARDS,
    DEFAULT_PENDING_EVICTION_LIMIT, SECTOR_SIZE,
};
pub use lru::EvictionError;
pub use meta::{CoreId, END_MARKER, LineId, MetaStore};
pub use partition::{PartConfig, PartId, Partition};
pub use request::{IoQueue, LookupStatus, MapSlot, Request};
