use crate::cache::Cache;
use crate::lru::iter::CleaningIter;
use crate::meta::{END_MARKER, LineId};
use crate::partition::{PartId, SingleFlightAcquire};
use crate::request::IoQueue;

/// Downstream write-back engine. `fire` receives the selected dirty lines,
/// each pinned with a shared line lock; the engine flushes them and then
/// calls [`Cache::cleaning_complete`], typically from an I/O completion.
pub trait Cleaner: Send + Sync {
    fn fire(&self, cache: &Cache, part: PartId, lines: &[LineId]);
}

/// Outcome of a cleaning trigger. Everything except `Fired` means no
/// write-back was started and no completion call is owed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleaningStatus {
    Fired,
    /// A previous batch for this partition is still in flight.
    AlreadyRunning,
    /// Cleaning is administratively disabled for this partition.
    Disabled,
    /// A management operation holds the cache; selection would race with it.
    ManagementLocked,
    /// No dirty line could be selected.
    NothingToClean,
}

impl Cache {
    /// Selects up to `count` dirty lines from `part` (capped at the
    /// configured batch size) and hands them to the cleaner. At most one
    /// batch per partition is in flight; concurrent triggers collapse into
    /// `AlreadyRunning` instead of duplicating write-back.
    ///
    /// Selection holds every shard lock at once so the dirty lists cannot
    /// shift mid-scan; individual lines already locked for I/O are skipped.
    /// The shard locks are dropped before the cleaner runs.
    pub fn start_cleaning(
        &self,
        part: PartId,
        queue: &IoQueue,
        count: u32,
        cleaner: &dyn Cleaner,
    ) -> CleaningStatus {
        assert!(part != PartId::FREELIST, "cleaning the freelist");
        if self.management_locked() {
            return CleaningStatus::ManagementLocked;
        }
        let partition = self.partition(part);
        match partition.cleaning.guard.try_acquire() {
            SingleFlightAcquire::Acquired => {}
            SingleFlightAcquire::Busy => return CleaningStatus::AlreadyRunning,
            SingleFlightAcquire::Disabled => return CleaningStatus::Disabled,
        }

        let seed = queue.next_eviction_idx() as usize % self.config().num_shards;
        let mut picked = Vec::new();
        {
            // shard locks in index order, all at once
            let guards: Vec<_> = self.shards().iter().map(|s| s.write()).collect();
            let mut iter = CleaningIter::new(&guards, self.line_locks(), part, seed);
            let mut batch = partition.cleaning.batch.lock();
            let take = (count as usize).min(batch.len());
            while picked.len() < take {
                let Some(line) = iter.next() else { break };
                batch[picked.len()] = line;
                picked.push(line);
            }
            for slot in batch[picked.len()..].iter_mut() {
                *slot = END_MARKER;
            }
        }

        if picked.is_empty() {
            partition.cleaning.guard.release();
            return CleaningStatus::NothingToClean;
        }

        tracing::debug!(part = part.0, lines = picked.len(), "cleaning batch fired");
        cleaner.fire(self, part, &picked);
        CleaningStatus::Fired
    }

    /// Completion of a fired batch: unpins the selected lines and re-arms
    /// the partition's cleaning guard.
    pub fn cleaning_complete(&self, part: PartId) {
        let partition = self.partition(part);
        {
            let mut batch = partition.cleaning.batch.lock();
            for slot in batch.iter_mut() {
                if *slot != END_MARKER {
                    self.line_locks().unlock_rd(*slot);
                    *slot = END_MARKER;
                }
            }
        }
        partition.cleaning.guard.release();
    }

    /// Administratively disables cleaning triggers for `part`. Nestable;
    /// each disable needs a matching enable.
    pub fn disable_cleaning(&self, part: PartId) {
        self.partition(part).cleaning.guard.freeze();
    }

    pub fn enable_cleaning(&self, part: PartId) {
        self.partition(part).cleaning.guard.unfreeze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::partition::PartConfig;
    use crate::request::Request;
    use crate::meta::CoreId;

    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn populate(cache: &Cache, count: u32) {
        for line in count..cache.meta().num_lines() {
            cache.meta().mark_valid(line, 0..1);
        }
        cache.populate_freelist(count);
    }

    fn cache_with_dirty(num_dirty: u32) -> (Cache, Vec<LineId>) {
        let config = CacheConfig {
            num_lines: 64,
            num_shards: 4,
            num_user_parts: 1,
            num_cores: 1,
            num_hash_buckets: 64,
            ..CacheConfig::default()
        };
        let cache = Cache::try_new(config, vec![PartConfig::default()]).unwrap();
        populate(&cache, num_dirty);

        let mut req = Request::new(
            CoreId(0),
            0,
            num_dirty as u64 - 1,
            PartId(0),
            Arc::new(IoQueue::new()),
        );
        req.lock_hash_range(cache.hash_locks());
        assert_eq!(
            cache
                .assign_lines(&mut req, PartId::FREELIST, num_dirty)
                .unwrap(),
            num_dirty
        );
        let lines: Vec<LineId> = req.map().iter().map(|s| s.line).collect();
        req.unlock_lines(cache.line_locks());
        req.unlock_hash_range(cache.hash_locks());
        for &line in &lines {
            cache.mark_dirty(line);
        }
        (cache, lines)
    }

    struct RecordingCleaner {
        fired: Mutex<Vec<LineId>>,
    }

    impl Cleaner for RecordingCleaner {
        fn fire(&self, _cache: &Cache, _part: PartId, lines: &[LineId]) {
            self.fired.lock().unwrap().extend_from_slice(lines);
        }
    }

    #[test]
    fn fires_a_batch_of_pinned_dirty_lines() {
        let (cache, _lines) = cache_with_dirty(8);
        let queue = IoQueue::new();
        let cleaner = RecordingCleaner {
            fired: Mutex::new(Vec::new()),
        };

        let status = cache.start_cleaning(PartId(0), &queue, 5, &cleaner);
        assert_eq!(status, CleaningStatus::Fired);
        let fired = cleaner.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 5);
        for &line in &fired {
            // pinned shared: readable, not writable
            assert!(!cache.line_locks().try_lock_wr(line));
            assert!(cache.line_locks().try_lock_rd(line));
            cache.line_locks().unlock_rd(line);
        }

        cache.cleaning_complete(PartId(0));
        for &line in &fired {
            assert!(cache.line_locks().try_lock_wr(line));
            cache.line_locks().unlock_wr(line);
        }
    }

    #[test]
    fn selection_skips_write_locked_dirty_lines() {
        let (cache, lines) = cache_with_dirty(4);
        // in-flight I/O holds this line exclusively
        assert!(cache.line_locks().try_lock_wr(lines[1]));

        let queue = IoQueue::new();
        let cleaner = RecordingCleaner {
            fired: Mutex::new(Vec::new()),
        };
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 4, &cleaner),
            CleaningStatus::Fired
        );
        let fired = cleaner.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 3);
        assert!(!fired.contains(&lines[1]));

        cache.cleaning_complete(PartId(0));
        cache.line_locks().unlock_wr(lines[1]);
    }

    #[test]
    fn second_trigger_collapses_until_completion() {
        let (cache, _lines) = cache_with_dirty(8);
        let queue = IoQueue::new();
        let cleaner = RecordingCleaner {
            fired: Mutex::new(Vec::new()),
        };

        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::Fired
        );
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::AlreadyRunning
        );
        cache.cleaning_complete(PartId(0));
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::Fired
        );
        cache.cleaning_complete(PartId(0));
    }

    #[test]
    fn disabled_and_empty_partitions_decline() {
        let (cache, lines) = cache_with_dirty(2);
        let queue = IoQueue::new();
        let cleaner = RecordingCleaner {
            fired: Mutex::new(Vec::new()),
        };

        cache.disable_cleaning(PartId(0));
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::Disabled
        );
        cache.enable_cleaning(PartId(0));

        for &line in &lines {
            cache.mark_clean(line);
        }
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::NothingToClean
        );
    }

    #[test]
    fn trigger_declines_under_management_lock() {
        let (cache, _lines) = cache_with_dirty(2);
        let queue = IoQueue::new();
        let cleaner = RecordingCleaner {
            fired: Mutex::new(Vec::new()),
        };
        let guard = cache.management_lock();
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::ManagementLocked
        );
        drop(guard);
        assert_eq!(
            cache.start_cleaning(PartId(0), &queue, 2, &cleaner),
            CleaningStatus::Fired
        );
        cache.cleaning_complete(PartId(0));
    }

    struct CountingCleaner {
        fires: AtomicU32,
    }

    impl Cleaner for CountingCleaner {
        fn fire(&self, _cache: &Cache, _part: PartId, _lines: &[LineId]) {
            self.fires.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn racing_triggers_fire_exactly_once() {
        let (cache, _lines) = cache_with_dirty(16);
        let cache = Arc::new(cache);
        let cleaner = Arc::new(CountingCleaner {
            fires: AtomicU32::new(0),
        });

        let mut handles = Vec::new();
        let mut statuses = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let cleaner = cleaner.clone();
            handles.push(std::thread::spawn(move || {
                let queue = IoQueue::new();
                cache.start_cleaning(PartId(0), &queue, 4, cleaner.as_ref())
            }));
        }
        for h in handles {
            statuses.push(h.join().unwrap());
        }

        assert_eq!(cleaner.fires.load(Ordering::Relaxed), 1);
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == CleaningStatus::Fired)
                .count(),
            1
        );
        cache.cleaning_complete(PartId(0));
    }
}
