use crate::meta::LineId;

use std::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 1 << 31;

#[derive(Default)]
struct Slot {
    // bit 31: writer held, low bits: reader count
    state: AtomicU32,
    waiters: AtomicU32,
}

/// Per-line read/write try-locks with waiter accounting.
///
/// The victim-selection path only ever try-locks and skips on failure, so
/// these locks never park on that path. The blocking variants exist for
/// collaborators that queue on a specific line (request mapping, management);
/// while queued they are counted as waiters, which the eviction iterator
/// consults to avoid stealing a line somebody is already waiting for.
pub struct LineLocks {
    slots: Box<[Slot]>,
}

impl LineLocks {
    pub(crate) fn new(num_lines: u32) -> Self {
        Self {
            slots: (0..num_lines).map(|_| Slot::default()).collect(),
        }
    }

    pub fn try_lock_rd(&self, line: LineId) -> bool {
        let state = &self.slots[line as usize].state;
        state
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |s| {
                if s & WRITER != 0 { None } else { Some(s + 1) }
            })
            .is_ok()
    }

    pub fn try_lock_wr(&self, line: LineId) -> bool {
        self.slots[line as usize]
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock_rd(&self, line: LineId) {
        let prev = self.slots[line as usize]
            .state
            .fetch_sub(1, Ordering::Release);
        assert!(prev & WRITER == 0 && prev > 0, "read-unlock of unheld line lock");
    }

    pub fn unlock_wr(&self, line: LineId) {
        let prev = self.slots[line as usize].state.swap(0, Ordering::Release);
        assert_eq!(prev, WRITER, "write-unlock of unheld line lock");
    }

    /// Blocking write acquisition; the caller is counted as a waiter until
    /// the lock is obtained.
    pub fn lock_wr(&self, line: LineId) {
        self.add_waiter(line);
        while !self.try_lock_wr(line) {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        self.remove_waiter(line);
    }

    /// Blocking shared acquisition; counted as a waiter until obtained.
    pub fn lock_rd(&self, line: LineId) {
        self.add_waiter(line);
        while !self.try_lock_rd(line) {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        self.remove_waiter(line);
    }

    /// Registers a queued waiter without blocking. Request machinery that
    /// parks on a line it failed to lock announces itself here and retries
    /// from its completion callback.
    pub fn add_waiter(&self, line: LineId) {
        self.slots[line as usize].waiters.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_waiter(&self, line: LineId) {
        let prev = self.slots[line as usize]
            .waiters
            .fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "waiter count underflow");
    }

    /// True while any context is queued on this line.
    pub fn has_waiters(&self, line: LineId) -> bool {
        self.slots[line as usize].waiters.load(Ordering::Acquire) > 0
    }

    /// True when the line is held (shared or exclusive) or waited on.
    pub fn is_used(&self, line: LineId) -> bool {
        self.slots[line as usize].state.load(Ordering::Acquire) != 0 || self.has_waiters(line)
    }
}
