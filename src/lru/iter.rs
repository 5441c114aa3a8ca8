use crate::cache::Cache;
use crate::concurrency::LineLocks;
use crate::lru::list::{ListKind, ListSel, Shard};
use crate::meta::{CoreId, END_MARKER, LineId};
use crate::partition::PartId;
use crate::request::Request;

use parking_lot::RwLockWriteGuard;

/// Rotating pick-next over shard indices with per-pass exhaustion marks.
/// Plain availability flags rather than a rotate bitmask, so shard counts
/// above 64 are fine.
pub(crate) struct ShardRotation {
    avail: Box<[bool]>,
    remaining: usize,
    cursor: usize,
}

impl ShardRotation {
    pub(crate) fn new(num_shards: usize, seed: usize) -> Self {
        Self {
            avail: vec![true; num_shards].into_boxed_slice(),
            remaining: num_shards,
            // next() advances first, so the first pick lands on the seed
            cursor: (seed + num_shards - 1) % num_shards,
        }
    }

    pub(crate) fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            self.cursor = (self.cursor + 1) % self.avail.len();
            if self.avail[self.cursor] {
                return Some(self.cursor);
            }
        }
    }

    pub(crate) fn mark_exhausted(&mut self, idx: usize) {
        if self.avail[idx] {
            self.avail[idx] = false;
            self.remaining -= 1;
        }
    }
}

/// A victim accepted by the eviction iterator: the line is write-locked, and
/// when it came from a user partition its old mapping (still installed) and
/// bucket lock travel with it.
pub(crate) struct Victim {
    pub(crate) line: LineId,
    pub(crate) mapping: Option<(CoreId, u64)>,
}

/// Walks a source partition's clean lists tail-first across rotating shards,
/// yielding validated victims. One rotation step per victim, so concurrent
/// callers with different seeds interleave across shards.
pub(crate) struct EvictionIter<'a> {
    cache: &'a Cache,
    src: PartId,
    rotation: ShardRotation,
}

impl<'a> EvictionIter<'a> {
    pub(crate) fn new(cache: &'a Cache, src: PartId, seed: usize) -> Self {
        Self {
            cache,
            src,
            rotation: ShardRotation::new(cache.config().num_shards, seed),
        }
    }

    /// Full victim-selection protocol for user-partition eviction. On
    /// success the line is write-locked, its hash bucket is write-locked
    /// (unless the request already owned it), and the line has been moved to
    /// the head of `dst`'s clean list.
    pub(crate) fn next_eviction(&mut self, req: &Request, dst: PartId) -> Option<Victim> {
        let src_sel = ListSel::new(self.src, ListKind::Clean);
        loop {
            let s = self.rotation.next()?;
            let mut shard = self.cache.shard(s).write();

            let mut line = shard.list(src_sel).tail;
            let mut accepted = None;
            while line != END_MARKER {
                if let Some(mapping) = self.try_victim_lock(line, req) {
                    accepted = Some(mapping);
                    break;
                }
                line = shard.node(line).prev;
            }

            if let Some(mapping) = accepted {
                if dst != self.src {
                    self.cache.move_line_locked(
                        &mut shard,
                        line,
                        src_sel,
                        ListSel::new(dst, ListKind::Clean),
                    );
                } else {
                    let ratio = self.cache.config().hot_ratio;
                    shard.unlink(src_sel, line);
                    shard.push_head(src_sel, line);
                    shard.balance(src_sel, ratio);
                }
                return Some(Victim {
                    line,
                    mapping: Some(mapping),
                });
            }
            self.rotation.mark_exhausted(s);
        }
    }

    /// Freelist mode: unassigned lines have no mapping, no self-overlap risk
    /// and nobody queues on them, so only the write-lock attempt remains.
    pub(crate) fn next_free(&mut self, dst: PartId) -> Option<Victim> {
        let free_sel = ListSel::new(PartId::FREELIST, ListKind::Clean);
        let locks = self.cache.line_locks();
        loop {
            let s = self.rotation.next()?;
            let mut shard = self.cache.shard(s).write();

            let mut line = shard.list(free_sel).tail;
            while line != END_MARKER && !locks.try_lock_wr(line) {
                line = shard.node(line).prev;
            }

            if line != END_MARKER {
                self.cache.move_line_locked(
                    &mut shard,
                    line,
                    free_sel,
                    ListSel::new(dst, ListKind::Clean),
                );
                return Some(Victim {
                    line,
                    mapping: None,
                });
            }
            self.rotation.mark_exhausted(s);
        }
    }

    /// Steps 1-5 of the per-candidate protocol: exclusive line lock, read
    /// the mapping, reject the caller's own target range, try the hash
    /// bucket (honoring buckets the request already holds), reject lines
    /// other contexts wait on. Every acquisition is try-and-skip; lock order
    /// is shard list (held by caller) -> line -> hash bucket.
    fn try_victim_lock(&self, line: LineId, req: &Request) -> Option<(CoreId, u64)> {
        let locks = self.cache.line_locks();
        let hash = self.cache.hash_locks();

        if !locks.try_lock_wr(line) {
            return None;
        }

        let Some((core, core_line)) = self.cache.meta().mapping(line) else {
            debug_assert!(false, "unmapped line on a user partition list");
            locks.unlock_wr(line);
            return None;
        };

        if req.covers(core, core_line) {
            locks.unlock_wr(line);
            return None;
        }

        let bucket = hash.bucket_index(core, core_line);
        let owned = req.owns_bucket(bucket);
        if !owned && !hash.try_lock_wr(bucket) {
            locks.unlock_wr(line);
            return None;
        }

        if locks.has_waiters(line) {
            if !owned {
                hash.unlock_wr(bucket);
            }
            locks.unlock_wr(line);
            return None;
        }

        Some((core, core_line))
    }
}

/// Cleaning mode: the caller holds every shard lock for the whole scan, so
/// this iterator keeps per-shard resume cursors instead of re-reading tails,
/// and takes shared line locks: the lines are only pinned against
/// invalidation while flush I/O reads them, nothing is remapped.
pub(crate) struct CleaningIter<'a, 'g> {
    guards: &'a [RwLockWriteGuard<'g, Shard>],
    locks: &'a LineLocks,
    rotation: ShardRotation,
    cursors: Vec<LineId>,
}

impl<'a, 'g> CleaningIter<'a, 'g> {
    pub(crate) fn new(
        guards: &'a [RwLockWriteGuard<'g, Shard>],
        locks: &'a LineLocks,
        part: PartId,
        seed: usize,
    ) -> Self {
        let sel = ListSel::new(part, ListKind::Dirty);
        let cursors = guards.iter().map(|g| g.list(sel).tail).collect();
        let rotation = ShardRotation::new(guards.len(), seed);
        Self {
            guards,
            locks,
            rotation,
            cursors,
        }
    }

    pub(crate) fn next(&mut self) -> Option<LineId> {
        loop {
            let s = self.rotation.next()?;
            let shard = &self.guards[s];

            let mut line = self.cursors[s];
            while line != END_MARKER && !self.locks.try_lock_rd(line) {
                line = shard.node(line).prev;
            }

            if line != END_MARKER {
                self.cursors[s] = shard.node(line).prev;
                return Some(line);
            }
            self.rotation.mark_exhausted(s);
        }
    }
}
