use crate::concurrency::{HashLocks, LineLocks};
use crate::config::{CacheConfig, ConfigError};
use crate::lru::list::Shard;
use crate::meta::{LineId, MetaStore};
use crate::partition::{PartConfig, PartId, Partition};

use std::sync::atomic::AtomicU32;

use parking_lot::{RwLock, RwLockWriteGuard};

/// Proof that the whole-cache management lock is held; required by bulk
/// operations and checked by the cleaning path.
pub struct ManagementGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// The line-replacement engine: per-shard approximate-LRU lists, partition
/// accounting, victim selection and the cleaning hand-off, all over a flat
/// line-id-indexed metadata store.
///
/// Ownership is explicit: the cache owns its metadata store, lock arrays,
/// shards and partitions; iterators borrow them for the duration of one
/// call. Lock order everywhere is shard list -> line -> hash bucket.
pub struct Cache {
    config: CacheConfig,
    meta: MetaStore,
    line_locks: LineLocks,
    hash_locks: HashLocks,
    shards: Box<[RwLock<Shard>]>,
    parts: Box<[Partition]>,
    free: Partition,
    pub(crate) pending_evictions: AtomicU32,
    mgmt: RwLock<()>,
}

impl Cache {
    pub fn try_new(config: CacheConfig, part_configs: Vec<PartConfig>) -> Result<Self, ConfigError> {
        config.validate()?;
        if part_configs.len() != config.num_user_parts as usize {
            return Err(ConfigError::PartCountMismatch {
                expected: config.num_user_parts as usize,
                got: part_configs.len(),
            });
        }

        let meta = MetaStore::new(
            config.num_lines,
            config.sectors_per_line(),
            config.num_cores,
            config.num_user_parts,
        );
        let shards = (0..config.num_shards)
            .map(|i| {
                RwLock::new(Shard::new(
                    i,
                    config.num_shards,
                    config.num_lines,
                    config.num_user_parts,
                ))
            })
            .collect();
        let parts = part_configs
            .into_iter()
            .enumerate()
            .map(|(i, pc)| Partition::new(PartId(i as u16), pc, config.clean_batch))
            .collect();
        let free = Partition::new(PartId::FREELIST, PartConfig::default(), config.clean_batch);

        Ok(Self {
            line_locks: LineLocks::new(config.num_lines),
            hash_locks: HashLocks::new(config.num_hash_buckets),
            meta,
            shards,
            parts,
            free,
            pending_evictions: AtomicU32::new(0),
            mgmt: RwLock::new(()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The line-state store collaborator, for valid-bit and dirty-flag
    /// maintenance by I/O completion paths.
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn line_locks(&self) -> &LineLocks {
        &self.line_locks
    }

    pub fn hash_locks(&self) -> &HashLocks {
        &self.hash_locks
    }

    pub fn partition(&self, part: PartId) -> &Partition {
        if part == PartId::FREELIST {
            &self.free
        } else {
            &self.parts[part.0 as usize]
        }
    }

    pub(crate) fn shard_of(&self, line: LineId) -> usize {
        (line as usize) % self.config.num_shards
    }

    pub(crate) fn shard(&self, idx: usize) -> &RwLock<Shard> {
        &self.shards[idx]
    }

    pub(crate) fn shards(&self) -> &[RwLock<Shard>] {
        &self.shards
    }

    /// Acquires the whole-cache management lock. While held, cleaning
    /// declines to start and bulk scans may run.
    pub fn management_lock(&self) -> ManagementGuard<'_> {
        ManagementGuard {
            _guard: self.mgmt.write(),
        }
    }

    pub(crate) fn management_locked(&self) -> bool {
        self.mgmt.is_locked()
    }
}
