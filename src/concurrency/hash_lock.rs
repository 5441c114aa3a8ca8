use crate::meta::{CoreId, LineId};

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as _;

// SAFETY:
// The map inside each bucket is only touched while the bucket's raw lock is
// held exclusively (debug-asserted in every accessor), so it is safe to mark
// Bucket as Sync despite the UnsafeCell.
unsafe impl Sync for Bucket {}

// The reverse-lookup table is guarded by a raw lock rather than a regular
// RwLock<HashMap>: the eviction path hands a locked bucket to the caller and
// the unlock happens in a different function (or thread) than the lock, which
// guard types cannot express.
struct Bucket {
    lock: RawRwLock,
    map: UnsafeCell<HashMap<(CoreId, u64), LineId>>,
}

/// Reverse-lookup hash buckets: `(core, core_line) -> line`, each bucket
/// guarded by its own write lock.
pub struct HashLocks {
    buckets: Box<[Bucket]>,
}

impl HashLocks {
    pub(crate) fn new(num_buckets: usize) -> Self {
        Self {
            buckets: (0..num_buckets)
                .map(|_| Bucket {
                    lock: RawRwLock::INIT,
                    map: UnsafeCell::new(HashMap::new()),
                })
                .collect(),
        }
    }

    /// Bucket guarding the given `(core, core_line)` pair.
    pub fn bucket_index(&self, core: CoreId, core_line: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        (core, core_line).hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    pub fn try_lock_wr(&self, bucket: usize) -> bool {
        self.buckets[bucket].lock.try_lock_exclusive()
    }

    pub fn lock_wr(&self, bucket: usize) {
        self.buckets[bucket].lock.lock_exclusive();
    }

    pub fn unlock_wr(&self, bucket: usize) {
        // SAFETY: the caller holds this bucket's exclusive lock.
        unsafe { self.buckets[bucket].lock.unlock_exclusive() }
    }

    /// Inserts a reverse mapping. The bucket lock must be held.
    pub(crate) fn insert(&self, bucket: usize, core: CoreId, core_line: u64, line: LineId) {
        let b = &self.buckets[bucket];
        debug_assert!(b.lock.is_locked());
        // SAFETY: bucket lock held exclusively by the caller.
        let map = unsafe { &mut *b.map.get() };
        map.insert((core, core_line), line);
    }

    /// Removes a reverse mapping. The bucket lock must be held.
    pub(crate) fn remove(&self, bucket: usize, core: CoreId, core_line: u64) -> Option<LineId> {
        let b = &self.buckets[bucket];
        debug_assert!(b.lock.is_locked());
        // SAFETY: bucket lock held exclusively by the caller.
        let map = unsafe { &mut *b.map.get() };
        map.remove(&(core, core_line))
    }

    /// Looks up a reverse mapping. The bucket lock must be held.
    pub fn lookup(&self, bucket: usize, core: CoreId, core_line: u64) -> Option<LineId> {
        let b = &self.buckets[bucket];
        debug_assert!(b.lock.is_locked());
        // SAFETY: bucket lock held by the caller.
        let map = unsafe { &*b.map.get() };
        map.get(&(core, core_line)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_lock_is_exclusive() {
        let locks = HashLocks::new(8);
        let b = locks.bucket_index(CoreId(0), 42);
        assert!(locks.try_lock_wr(b));
        assert!(!locks.try_lock_wr(b));
        locks.unlock_wr(b);
        assert!(locks.try_lock_wr(b));
        locks.unlock_wr(b);
    }

    #[test]
    fn reverse_mapping_roundtrip() {
        let locks = HashLocks::new(8);
        let b = locks.bucket_index(CoreId(1), 7);
        locks.lock_wr(b);
        locks.insert(b, CoreId(1), 7, 33);
        assert_eq!(locks.lookup(b, CoreId(1), 7), Some(33));
        assert_eq!(locks.remove(b, CoreId(1), 7), Some(33));
        assert_eq!(locks.lookup(b, CoreId(1), 7), None);
        locks.unlock_wr(b);
    }
}
