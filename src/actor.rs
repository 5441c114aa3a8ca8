use crate::cache::{Cache, ManagementGuard};
use crate::lru::list::{ListKind, ListSel};
use crate::meta::{CoreId, END_MARKER, LineId};
use crate::partition::PartId;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    /// At least one matching line was locked or waited on and got skipped;
    /// every other match was still visited. The caller backs off and reruns
    /// the scan. Actors are idempotent, so lines already visited are simply
    /// revisited on the retry.
    #[error("a matching line was in use, retry the scan")]
    NeedsRetry,
}

/// Selects which mapped lines a bulk scan visits. Unset fields match
/// everything; `byte_range` is a half-open `[start, end)` range over the
/// core address space.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanFilter {
    pub core: Option<CoreId>,
    pub byte_range: Option<(u64, u64)>,
    pub part: Option<PartId>,
}

impl ScanFilter {
    fn matches(&self, cache: &Cache, line: LineId) -> bool {
        let Some((core, core_line)) = cache.meta().mapping(line) else {
            return false;
        };
        if let Some(want) = self.core {
            if core != want {
                return false;
            }
        }
        if let Some((start, end)) = self.byte_range {
            let line_size = cache.config().line_size as u64;
            if end <= start {
                return false;
            }
            let first = start / line_size;
            let last = (end - 1) / line_size;
            if core_line < first || core_line > last {
                return false;
            }
        }
        if let Some(part) = self.part {
            if cache.meta().part_id(line) != part {
                return false;
            }
        }
        true
    }
}

impl Cache {
    /// Runs `actor` over every mapped line the filter selects. Management
    /// surgery on stable metadata: the guard argument proves no I/O is
    /// admitted.
    ///
    /// A partition filter narrows the walk to that partition's shard lists;
    /// without one the whole line-id space is swept. Lines still held or
    /// waited on by draining I/O are skipped, the rest of the matches are
    /// visited anyway, and the skip is reported as
    /// [`ScanError::NeedsRetry`] once the pass is complete.
    pub fn scan(
        &self,
        _mgmt: &ManagementGuard<'_>,
        filter: &ScanFilter,
        actor: &mut dyn FnMut(&Cache, LineId),
    ) -> Result<(), ScanError> {
        let mut conflicted = false;
        if let Some(part) = filter.part {
            assert!(part != PartId::FREELIST, "scanning the freelist");
            for idx in 0..self.config().num_shards {
                // collect under the shard lock, act after dropping it: the
                // actor is free to relink lines itself
                let candidates = {
                    let shard = self.shard(idx).read();
                    let mut lines = Vec::new();
                    for kind in [ListKind::Clean, ListKind::Dirty] {
                        let sel = ListSel::new(part, kind);
                        let mut line = shard.list(sel).tail;
                        while line != END_MARKER {
                            lines.push(line);
                            line = shard.node(line).prev;
                        }
                    }
                    lines
                };
                for line in candidates {
                    if !filter.matches(self, line) {
                        continue;
                    }
                    conflicted |= !self.visit(line, actor);
                }
            }
        } else {
            for line in 0..self.meta().num_lines() {
                if !filter.matches(self, line) {
                    continue;
                }
                conflicted |= !self.visit(line, actor);
            }
        }

        if conflicted {
            tracing::debug!("scan skipped in-use lines");
            return Err(ScanError::NeedsRetry);
        }
        Ok(())
    }

    /// Applies the actor unless the line is in use; false means skipped.
    fn visit(&self, line: LineId, actor: &mut dyn FnMut(&Cache, LineId)) -> bool {
        if self.line_locks().is_used(line) {
            return false;
        }
        actor(self, line);
        true
    }
}
