use crate::meta::{END_MARKER, LineId};

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;

/// Identifier of a quota partition (I/O class).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartId(pub u16);

impl PartId {
    /// The pseudo-partition holding unassigned lines.
    pub const FREELIST: PartId = PartId(u16::MAX);
}

/// Quota configuration of a user partition.
#[derive(Clone, Copy, Debug)]
pub struct PartConfig {
    pub priority: i16,
    pub min_size: u32,
    pub max_size: u32,
}

impl Default for PartConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            min_size: 0,
            max_size: u32::MAX,
        }
    }
}

pub(crate) enum SingleFlightAcquire {
    Acquired,
    Busy,
    Disabled,
}

/// Saturating single-flight counter: at most one holder at a time, and a
/// freeze side-counter that management uses to disable acquisition entirely.
pub(crate) struct SingleFlight {
    counter: AtomicI32,
    freeze: AtomicI32,
}

impl SingleFlight {
    fn new() -> Self {
        Self {
            counter: AtomicI32::new(0),
            freeze: AtomicI32::new(0),
        }
    }

    pub(crate) fn try_acquire(&self) -> SingleFlightAcquire {
        if self.freeze.load(Ordering::Acquire) > 0 {
            return SingleFlightAcquire::Disabled;
        }
        let val = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        if self.freeze.load(Ordering::Acquire) > 0 {
            self.release();
            return SingleFlightAcquire::Disabled;
        }
        if val > 1 {
            self.release();
            return SingleFlightAcquire::Busy;
        }
        SingleFlightAcquire::Acquired
    }

    pub(crate) fn release(&self) {
        let val = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(val >= 0, "single-flight counter underflow");
    }

    pub(crate) fn freeze(&self) {
        self.freeze.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unfreeze(&self) {
        let val = self.freeze.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(val >= 0, "single-flight freeze underflow");
    }
}

/// Per-partition cleaning state: the single-flight guard plus the batch of
/// lines currently pinned for write-back, sentinel-padded.
pub(crate) struct CleaningContext {
    pub(crate) guard: SingleFlight,
    pub(crate) batch: Mutex<Box<[LineId]>>,
}

impl CleaningContext {
    fn new(batch_size: u32) -> Self {
        Self {
            guard: SingleFlight::new(),
            batch: Mutex::new(vec![END_MARKER; batch_size as usize].into_boxed_slice()),
        }
    }
}

/// A quota domain owning one clean and one dirty list per shard (the lists
/// themselves live inside the shards, keyed by this partition's id).
pub struct Partition {
    id: PartId,
    config: PartConfig,
    pub(crate) curr_size: AtomicU32,
    pub(crate) cleaning: CleaningContext,
}

impl Partition {
    pub(crate) fn new(id: PartId, config: PartConfig, clean_batch: u32) -> Self {
        Self {
            id,
            config,
            curr_size: AtomicU32::new(0),
            cleaning: CleaningContext::new(clean_batch),
        }
    }

    pub fn id(&self) -> PartId {
        self.id
    }

    pub fn config(&self) -> &PartConfig {
        &self.config
    }

    /// Number of lines currently assigned to this partition. Monitoring
    /// read; exact only when externally quiesced.
    pub fn current_size(&self) -> u32 {
        self.curr_size.load(Ordering::Relaxed)
    }
}
