pub(crate) mod iter;
pub(crate) mod list;

use crate::cache::Cache;
use crate::lru::iter::EvictionIter;
use crate::lru::list::{ListKind, ListSel, Shard};
use crate::meta::{CoreId, END_MARKER, LineId};
use crate::partition::PartId;
use crate::request::{LookupStatus, Request};

use std::sync::atomic::Ordering;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EvictionError {
    /// The request has fewer unmapped slots than lines requested. Admission
    /// control is supposed to make this unreachable, so it is surfaced as a
    /// distinct error rather than silently clamped.
    #[error("request has {unmapped} unmapped slots, {requested} lines requested")]
    InsufficientSlots { unmapped: u32, requested: u32 },
}

impl Cache {
    /// Bulk-inserts `count` currently-invalid lines into the freelist.
    /// Called once at cache attach or recovery, before any I/O runs.
    ///
    /// Panics if fewer than `count` invalid lines exist; that means the
    /// caller's accounting of valid lines is corrupt.
    pub fn populate_freelist(&self, count: u32) {
        let free_sel = ListSel::new(PartId::FREELIST, ListKind::Clean);
        let ratio = self.config().hot_ratio;
        let mut inserted = 0u32;
        let mut line = 0;
        while line < self.meta().num_lines() && inserted < count {
            if !self.meta().any_valid(line) {
                self.meta().set_part_id(line, PartId::FREELIST);
                let mut shard = self.shard(self.shard_of(line)).write();
                shard.push_head(free_sel, line);
                shard.balance(free_sel, ratio);
                inserted += 1;
            }
            line += 1;
        }
        assert_eq!(inserted, count, "not enough invalid lines to populate freelist");
        // the count must also not undershoot: every line past the last one
        // inserted has to hold valid data
        assert!(
            (line..self.meta().num_lines()).all(|l| self.meta().any_valid(l)),
            "invalid lines left after freelist population"
        );
        self.partition(PartId::FREELIST)
            .curr_size
            .store(count, Ordering::Relaxed);
        tracing::debug!(count, "freelist populated");
    }

    /// Supplies up to `count` victim lines from `src` (a user partition or
    /// the freelist) to the request, returning how many were assigned.
    ///
    /// Short counts are not errors: exhaustion of `src` and the global
    /// pending-eviction ceiling both end the supply early, and the caller
    /// retries or fails the encompassing I/O. Every assigned line is
    /// write-locked on behalf of the request, recorded in its map as
    /// `Remapped`, and inserted into the reverse lookup; victims taken from
    /// a user partition have their previous mapping invalidated first.
    ///
    /// The caller must hold write locks on its own hash-bucket range
    /// ([`Request::lock_hash_range`]) for the whole call.
    pub fn assign_lines(
        &self,
        req: &mut Request,
        src: PartId,
        count: u32,
    ) -> Result<u32, EvictionError> {
        if count == 0 {
            return Ok(0);
        }
        if req.unmapped_count() < count {
            tracing::error!(
                unmapped = req.unmapped_count(),
                requested = count,
                "not enough space in request"
            );
            return Err(EvictionError::InsufficientSlots {
                unmapped: req.unmapped_count(),
                requested: count,
            });
        }
        assert!(req.part_id() != PartId::FREELIST, "request targets the freelist");

        let dst = req.part_id();
        let seed = req.queue().next_eviction_idx() as usize % self.config().num_shards;
        let mut iter = EvictionIter::new(self, src, seed);

        let mut req_idx = 0usize;
        let mut assigned = 0u32;
        while assigned < count {
            if !self.can_evict() {
                tracing::debug!("pending-eviction ceiling reached, supplying short");
                break;
            }

            let victim = if src == PartId::FREELIST {
                iter.next_free(dst)
            } else {
                iter.next_eviction(req, dst)
            };
            let Some(victim) = victim else { break };
            assert!(!self.meta().is_dirty(victim.line), "dirty line selected for eviction");

            // next unmapped slot in the request
            while req_idx + 1 < req.map().len()
                && req.map()[req_idx].status != LookupStatus::Miss
            {
                req_idx += 1;
            }
            assert_eq!(req.map()[req_idx].status, LookupStatus::Miss);

            if let Some((core, core_line)) = victim.mapping {
                self.invalidate_line(victim.line, core, core_line, src);
                let bucket = self.hash_locks().bucket_index(core, core_line);
                if !req.owns_bucket(bucket) {
                    self.hash_locks().unlock_wr(bucket);
                }
                self.pending_evictions.fetch_add(1, Ordering::Relaxed);
            }

            self.map_to_request(req, req_idx, victim.line);

            req_idx += 1;
            assigned += 1;
            // victims to assign have to fit the remaining request slots
            debug_assert!(req_idx < req.map().len() || assigned == count);
        }

        Ok(assigned)
    }

    /// Detaches a single line back to the freelist. Used on single-line
    /// invalidation, after the caller has torn down the line's mapping.
    pub fn remove_line(&self, line: LineId) {
        let mut shard = self.shard(self.shard_of(line)).write();
        let part = self.meta().part_id(line);
        assert!(part != PartId::FREELIST, "detaching an unassigned line");
        debug_assert!(!self.meta().is_dirty(line), "detaching a dirty line");
        let kind = if self.meta().is_dirty(line) {
            ListKind::Dirty
        } else {
            ListKind::Clean
        };
        self.move_line_locked(
            &mut shard,
            line,
            ListSel::new(part, kind),
            ListSel::new(PartId::FREELIST, ListKind::Clean),
        );
    }

    /// Moves a line between user partitions, preserving its clean/dirty
    /// classification. Used by QoS reclassification.
    pub fn repartition(&self, line: LineId, dst: PartId) {
        assert!(dst != PartId::FREELIST, "repartitioning to the freelist");
        let mut shard = self.shard(self.shard_of(line)).write();
        let src = self.meta().part_id(line);
        assert!(src != PartId::FREELIST, "repartitioning an unassigned line");
        if src == dst {
            return;
        }
        let kind = if self.meta().is_dirty(line) {
            ListKind::Dirty
        } else {
            ListKind::Clean
        };
        self.move_line_locked(
            &mut shard,
            line,
            ListSel::new(src, kind),
            ListSel::new(dst, kind),
        );
    }

    /// Recency update on a cache hit. Already-hot lines return without
    /// taking the list lock exclusively, which covers the common case.
    pub fn touch(&self, line: LineId) {
        let idx = self.shard_of(line);
        {
            let shard = self.shard(idx).read();
            if shard.node(line).hot {
                return;
            }
        }

        let mut shard = self.shard(idx).write();
        let part = self.meta().part_id(line);
        let kind = if self.meta().is_dirty(line) {
            ListKind::Dirty
        } else {
            ListKind::Clean
        };
        let sel = ListSel::new(part, kind);
        let ratio = self.config().hot_ratio;

        // the line may be freshly initialized and not linked anywhere yet
        let node = *shard.node(line);
        let list = shard.list(sel);
        if node.prev != END_MARKER
            || node.next != END_MARKER
            || list.head == line
            || list.tail == line
        {
            shard.unlink(sel, line);
        }
        shard.push_head(sel, line);
        shard.balance(sel, ratio);
    }

    /// Moves a line from its partition's dirty list to the clean list and
    /// clears the dirty flag. Called by the flush-completion path.
    pub fn mark_clean(&self, line: LineId) {
        self.dirty_transition(line, ListKind::Dirty, ListKind::Clean);
    }

    /// Moves a line from its partition's clean list to the dirty list and
    /// sets the dirty flag. Called by the write-completion path.
    pub fn mark_dirty(&self, line: LineId) {
        self.dirty_transition(line, ListKind::Clean, ListKind::Dirty);
    }

    fn dirty_transition(&self, line: LineId, from: ListKind, to: ListKind) {
        let mut shard = self.shard(self.shard_of(line)).write();
        let part = self.meta().part_id(line);
        assert!(part != PartId::FREELIST, "clean/dirty transition on the freelist");
        debug_assert_eq!(self.meta().is_dirty(line), from == ListKind::Dirty);
        let ratio = self.config().hot_ratio;
        shard.unlink(ListSel::new(part, from), line);
        shard.balance(ListSel::new(part, from), ratio);
        self.meta().set_dirty(line, to == ListKind::Dirty);
        shard.push_head(ListSel::new(part, to), line);
        shard.balance(ListSel::new(part, to), ratio);
    }

    /// Backpressure check for admission control: false once the number of
    /// lines mid-eviction reaches the configured ceiling.
    pub fn can_evict(&self) -> bool {
        self.pending_evictions.load(Ordering::Relaxed) < self.config().pending_eviction_limit
    }

    /// Reports that `count` previously assigned victims finished their
    /// eviction I/O, releasing backpressure.
    pub fn eviction_finished(&self, count: u32) {
        let prev = self.pending_evictions.fetch_sub(count, Ordering::Relaxed);
        assert!(prev >= count, "pending-eviction counter underflow");
    }

    /// Number of lines currently on the freelist.
    pub fn free_line_count(&self) -> u32 {
        self.partition(PartId::FREELIST).current_size()
    }

    /// Unlink from `src`, relink at the head of `dst`, rebalance both, and
    /// fix partition accounting. Eviction, clean/dirty transition and
    /// repartitioning are all this one primitive with different endpoints.
    /// The shard lock is held by the caller.
    pub(crate) fn move_line_locked(
        &self,
        shard: &mut Shard,
        line: LineId,
        src: ListSel,
        dst: ListSel,
    ) {
        let ratio = self.config().hot_ratio;
        shard.unlink(src, line);
        shard.balance(src, ratio);
        shard.push_head(dst, line);
        shard.balance(dst, ratio);
        self.partition(src.part).curr_size.fetch_sub(1, Ordering::Relaxed);
        self.partition(dst.part).curr_size.fetch_add(1, Ordering::Relaxed);
        self.meta().set_part_id(line, dst.part);
    }

    /// Tears down a victim's previous mapping: valid bits, reverse lookup,
    /// per-core accounting. The line's write lock and the mapping's hash
    /// bucket lock are held by the caller. `src` is the partition the line
    /// was evicted from (its id metadata already points at the destination).
    fn invalidate_line(&self, line: LineId, core: CoreId, core_line: u64, src: PartId) {
        self.meta().clear_all_valid(line);
        let bucket = self.hash_locks().bucket_index(core, core_line);
        let removed = self.hash_locks().remove(bucket, core, core_line);
        debug_assert_eq!(removed, Some(line));
        self.meta().clear_mapping(line);
        self.meta().dec_cached(core, src);
    }

    /// Installs `line` as the mapping of the request's `idx` slot. The slot's
    /// hash bucket is among those the request holds.
    fn map_to_request(&self, req: &mut Request, idx: usize, line: LineId) {
        let core = req.core_id();
        let core_line = req.map()[idx].core_line;
        let bucket = self.hash_locks().bucket_index(core, core_line);
        debug_assert!(req.owns_bucket(bucket), "request must hold its hash range");
        self.hash_locks().insert(bucket, core, core_line, line);
        self.meta().set_mapping(line, core, core_line);
        self.meta().inc_cached(core, req.part_id());
        req.mark_remapped(idx, line);
    }
}
