use crate::partition::PartId;

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Identifier of a cache line, dense in `[0, num_lines)`.
pub type LineId = u32;

/// List-terminator sentinel. A real line id never equals this value.
pub const END_MARKER: LineId = u32::MAX;

/// Identifier of a backing core (front-end volume).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoreId(pub u16);

impl CoreId {
    pub const INVALID: CoreId = CoreId(u16::MAX);
}

const MAPPING_INVALID: u64 = u64::MAX;
const CORE_LINE_MASK: u64 = (1 << 48) - 1;

fn pack_mapping(core: CoreId, core_line: u64) -> u64 {
    assert!(core_line < CORE_LINE_MASK);
    assert!(core != CoreId::INVALID);
    ((core.0 as u64) << 48) | core_line
}

struct CoreCounters {
    cached: AtomicU32,
    per_part: Box<[AtomicU32]>,
}

/// Per-line metadata store: the flat, array-indexed record of each line's
/// current assignment.
///
/// The fields are atomics so that monitoring reads are always well-defined,
/// but every mutation happens under the lock the concurrency model assigns to
/// that field: the core mapping and valid bits change under the line's write
/// lock plus its hash-bucket lock, the partition id and dirty flag change
/// under the line's shard-list lock. The `(core, core_line)` pair is packed
/// into a single word so one load observes a consistent mapping.
pub struct MetaStore {
    num_lines: u32,
    sectors_per_line: u32,
    mapping: Box<[AtomicU64]>,
    valid: Box<[AtomicU64]>,
    dirty: Box<[AtomicBool]>,
    part: Box<[AtomicU16]>,
    cores: Box<[CoreCounters]>,
}

impl MetaStore {
    pub(crate) fn new(
        num_lines: u32,
        sectors_per_line: u32,
        num_cores: u16,
        num_user_parts: u16,
    ) -> Self {
        let n = num_lines as usize;
        let cores = (0..num_cores)
            .map(|_| CoreCounters {
                cached: AtomicU32::new(0),
                per_part: (0..num_user_parts).map(|_| AtomicU32::new(0)).collect(),
            })
            .collect();
        Self {
            num_lines,
            sectors_per_line,
            mapping: (0..n).map(|_| AtomicU64::new(MAPPING_INVALID)).collect(),
            valid: (0..n).map(|_| AtomicU64::new(0)).collect(),
            dirty: (0..n).map(|_| AtomicBool::new(false)).collect(),
            part: (0..n).map(|_| AtomicU16::new(PartId::FREELIST.0)).collect(),
            cores,
        }
    }

    pub fn num_lines(&self) -> u32 {
        self.num_lines
    }

    /// Current `(core, core_line)` reverse mapping of a line, if assigned.
    pub fn mapping(&self, line: LineId) -> Option<(CoreId, u64)> {
        let raw = self.mapping[line as usize].load(Ordering::Relaxed);
        if raw == MAPPING_INVALID {
            None
        } else {
            Some((CoreId((raw >> 48) as u16), raw & CORE_LINE_MASK))
        }
    }

    pub(crate) fn set_mapping(&self, line: LineId, core: CoreId, core_line: u64) {
        self.mapping[line as usize].store(pack_mapping(core, core_line), Ordering::Relaxed);
    }

    pub(crate) fn clear_mapping(&self, line: LineId) {
        self.mapping[line as usize].store(MAPPING_INVALID, Ordering::Relaxed);
    }

    pub fn is_dirty(&self, line: LineId) -> bool {
        self.dirty[line as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn set_dirty(&self, line: LineId, dirty: bool) {
        self.dirty[line as usize].store(dirty, Ordering::Relaxed);
    }

    pub fn part_id(&self, line: LineId) -> PartId {
        PartId(self.part[line as usize].load(Ordering::Relaxed))
    }

    pub(crate) fn set_part_id(&self, line: LineId, part: PartId) {
        self.part[line as usize].store(part.0, Ordering::Relaxed);
    }

    fn sector_mask(&self, sectors: &Range<u32>) -> u64 {
        assert!(sectors.end <= self.sectors_per_line);
        let mut mask = 0u64;
        for s in sectors.clone() {
            mask |= 1 << s;
        }
        mask
    }

    /// Marks a sector range of the line valid. Called by the I/O completion
    /// path once data has landed in the line.
    pub fn mark_valid(&self, line: LineId, sectors: Range<u32>) {
        let mask = self.sector_mask(&sectors);
        self.valid[line as usize].fetch_or(mask, Ordering::Relaxed);
    }

    pub fn mark_invalid(&self, line: LineId, sectors: Range<u32>) {
        let mask = self.sector_mask(&sectors);
        self.valid[line as usize].fetch_and(!mask, Ordering::Relaxed);
    }

    /// True when any sector of the line holds valid data.
    pub fn any_valid(&self, line: LineId) -> bool {
        self.valid[line as usize].load(Ordering::Relaxed) != 0
    }

    pub(crate) fn clear_all_valid(&self, line: LineId) {
        self.valid[line as usize].store(0, Ordering::Relaxed);
    }

    /// Number of lines currently mapped to `core`.
    pub fn cached_lines(&self, core: CoreId) -> u32 {
        self.cores[core.0 as usize].cached.load(Ordering::Relaxed)
    }

    /// Number of lines currently mapped to `core` within `part`.
    pub fn cached_lines_in_part(&self, core: CoreId, part: PartId) -> u32 {
        self.cores[core.0 as usize].per_part[part.0 as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn inc_cached(&self, core: CoreId, part: PartId) {
        let c = &self.cores[core.0 as usize];
        c.cached.fetch_add(1, Ordering::Relaxed);
        c.per_part[part.0 as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_cached(&self, core: CoreId, part: PartId) {
        let c = &self.cores[core.0 as usize];
        let prev = c.cached.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "core cached-line counter underflow");
        let prev = c.per_part[part.0 as usize].fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "per-partition cached-line counter underflow");
    }
}
