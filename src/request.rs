use crate::concurrency::{HashLocks, LineLocks};
use crate::meta::{CoreId, END_MARKER, LineId};
use crate::partition::PartId;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-queue state shared by concurrent requests; the monotonically
/// increasing eviction index seeds shard rotation so parallel callers spread
/// across shards instead of colliding on the same one.
#[derive(Default)]
pub struct IoQueue {
    eviction_idx: AtomicU32,
}

impl IoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_eviction_idx(&self) -> u32 {
        self.eviction_idx.fetch_add(1, Ordering::Relaxed)
    }
}

/// Mapping status of one core line covered by a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStatus {
    Miss,
    Hit,
    Remapped,
}

/// Per-core-line slot of a request's map.
#[derive(Clone, Copy, Debug)]
pub struct MapSlot {
    pub core_line: u64,
    pub status: LookupStatus,
    pub line: LineId,
    pub wr_locked: bool,
}

/// An in-flight I/O request targeting a contiguous core-line range.
///
/// Only the pieces of the request lifecycle this subsystem consumes are
/// modeled: the target range (to prevent self-eviction), the per-slot map
/// that eviction fills, and the set of hash buckets the request has locked
/// for its own range.
pub struct Request {
    core_id: CoreId,
    core_line_first: u64,
    core_line_last: u64,
    part_id: PartId,
    queue: Arc<IoQueue>,
    map: Vec<MapSlot>,
    unmapped: u32,
    locked_buckets: Vec<usize>,
}

impl Request {
    pub fn new(
        core_id: CoreId,
        core_line_first: u64,
        core_line_last: u64,
        part_id: PartId,
        queue: Arc<IoQueue>,
    ) -> Self {
        assert!(core_line_first <= core_line_last);
        let map: Vec<MapSlot> = (core_line_first..=core_line_last)
            .map(|core_line| MapSlot {
                core_line,
                status: LookupStatus::Miss,
                line: END_MARKER,
                wr_locked: false,
            })
            .collect();
        let unmapped = map.len() as u32;
        Self {
            core_id,
            core_line_first,
            core_line_last,
            part_id,
            queue,
            map,
            unmapped,
            locked_buckets: Vec::new(),
        }
    }

    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    pub fn part_id(&self) -> PartId {
        self.part_id
    }

    pub fn queue(&self) -> &IoQueue {
        &self.queue
    }

    pub fn map(&self) -> &[MapSlot] {
        &self.map
    }

    /// Number of slots still unmapped (status `Miss`).
    pub fn unmapped_count(&self) -> u32 {
        self.unmapped
    }

    /// True when `(core, core_line)` falls inside this request's own target
    /// range.
    pub fn covers(&self, core: CoreId, core_line: u64) -> bool {
        core == self.core_id
            && core_line >= self.core_line_first
            && core_line <= self.core_line_last
    }

    /// Write-locks the hash buckets guarding this request's core-line range,
    /// in ascending bucket order. Must be called before mapping the request.
    pub fn lock_hash_range(&mut self, hash: &HashLocks) {
        assert!(self.locked_buckets.is_empty());
        let mut buckets: Vec<usize> = (self.core_line_first..=self.core_line_last)
            .map(|cl| hash.bucket_index(self.core_id, cl))
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        for &b in &buckets {
            hash.lock_wr(b);
        }
        self.locked_buckets = buckets;
    }

    pub fn unlock_hash_range(&mut self, hash: &HashLocks) {
        for b in self.locked_buckets.drain(..) {
            hash.unlock_wr(b);
        }
    }

    /// True when the request already holds the given bucket's lock as part of
    /// its own range locking (covers hash collisions with foreign ranges).
    pub fn owns_bucket(&self, bucket: usize) -> bool {
        self.locked_buckets.binary_search(&bucket).is_ok()
    }

    pub(crate) fn mark_remapped(&mut self, idx: usize, line: LineId) {
        let slot = &mut self.map[idx];
        assert_eq!(slot.status, LookupStatus::Miss);
        slot.status = LookupStatus::Remapped;
        slot.line = line;
        slot.wr_locked = true;
        self.unmapped -= 1;
    }

    /// Releases every line lock held on behalf of this request, on completion
    /// or abort of the encompassing operation.
    pub fn unlock_lines(&mut self, locks: &LineLocks) {
        for slot in &mut self.map {
            if slot.wr_locked {
                locks.unlock_wr(slot.line);
                slot.wr_locked = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Request {
        Request::new(CoreId(0), 10, 13, PartId(0), Arc::new(IoQueue::new()))
    }

    #[test]
    fn covers_own_range_only() {
        let r = req();
        assert!(r.covers(CoreId(0), 10));
        assert!(r.covers(CoreId(0), 13));
        assert!(!r.covers(CoreId(0), 14));
        assert!(!r.covers(CoreId(1), 10));
    }

    #[test]
    fn hash_range_lock_and_ownership() {
        let hash = HashLocks::new(16);
        let mut r = req();
        r.lock_hash_range(&hash);
        let b = hash.bucket_index(CoreId(0), 11);
        assert!(r.owns_bucket(b));
        assert!(!hash.try_lock_wr(b));
        r.unlock_hash_range(&hash);
        assert!(hash.try_lock_wr(b));
        hash.unlock_wr(b);
    }

    #[test]
    fn remap_accounting() {
        let mut r = req();
        assert_eq!(r.unmapped_count(), 4);
        r.mark_remapped(0, 5);
        assert_eq!(r.unmapped_count(), 3);
        assert_eq!(r.map()[0].status, LookupStatus::Remapped);
        assert_eq!(r.map()[0].line, 5);
        assert!(r.map()[0].wr_locked);
    }
}
