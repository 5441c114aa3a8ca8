use crate::meta::{END_MARKER, LineId};
use crate::partition::PartId;

/// Intrusive list linkage of one cache line. Lives in the owning shard's
/// node table, only touched under that shard's lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LruNode {
    pub(crate) hot: bool,
    pub(crate) prev: LineId,
    pub(crate) next: LineId,
}

impl Default for LruNode {
    fn default() -> Self {
        Self {
            hot: false,
            prev: END_MARKER,
            next: END_MARKER,
        }
    }
}

/// One approximate-LRU list: a doubly linked list over line ids with a hot
/// prefix. `hot_boundary` is the hot node farthest from the head when
/// `track_hot` and `hot_count > 0`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LruList {
    pub(crate) head: LineId,
    pub(crate) tail: LineId,
    pub(crate) count: u32,
    pub(crate) hot_count: u32,
    pub(crate) hot_boundary: LineId,
    pub(crate) track_hot: bool,
}

impl LruList {
    pub(crate) fn new(track_hot: bool) -> Self {
        Self {
            head: END_MARKER,
            tail: END_MARKER,
            count: 0,
            hot_count: 0,
            hot_boundary: END_MARKER,
            track_hot,
        }
    }
}

/// Which of a partition's two lists a line sits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListKind {
    Clean,
    Dirty,
}

/// Selects one list within a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ListSel {
    pub(crate) part: PartId,
    pub(crate) kind: ListKind,
}

impl ListSel {
    pub(crate) fn new(part: PartId, kind: ListKind) -> Self {
        debug_assert!(part != PartId::FREELIST || kind == ListKind::Clean);
        Self { part, kind }
    }
}

struct PartLists {
    clean: LruList,
    dirty: LruList,
}

/// One lock domain of the replacement structure: the node table for every
/// line with `line % num_shards == index`, plus this shard's slice of every
/// partition's lists and of the freelist. The owning `RwLock` makes all of
/// it consistent; list links never cross shards.
pub(crate) struct Shard {
    index: u32,
    stride: u32,
    nodes: Box<[LruNode]>,
    free: LruList,
    parts: Box<[PartLists]>,
}

impl Shard {
    pub(crate) fn new(index: usize, num_shards: usize, num_lines: u32, num_user_parts: u16) -> Self {
        let slots = (num_lines as usize).div_ceil(num_shards);
        Self {
            index: index as u32,
            stride: num_shards as u32,
            nodes: vec![LruNode::default(); slots].into_boxed_slice(),
            free: LruList::new(false),
            parts: (0..num_user_parts)
                .map(|_| PartLists {
                    clean: LruList::new(true),
                    dirty: LruList::new(true),
                })
                .collect(),
        }
    }

    fn slot(&self, line: LineId) -> usize {
        debug_assert_ne!(line, END_MARKER);
        debug_assert_eq!(line % self.stride, self.index, "line from foreign shard");
        (line / self.stride) as usize
    }

    pub(crate) fn node(&self, line: LineId) -> &LruNode {
        &self.nodes[self.slot(line)]
    }

    fn node_mut(&mut self, line: LineId) -> &mut LruNode {
        let slot = self.slot(line);
        &mut self.nodes[slot]
    }

    pub(crate) fn list(&self, sel: ListSel) -> &LruList {
        if sel.part == PartId::FREELIST {
            &self.free
        } else {
            let lists = &self.parts[sel.part.0 as usize];
            match sel.kind {
                ListKind::Clean => &lists.clean,
                ListKind::Dirty => &lists.dirty,
            }
        }
    }

    fn list_mut(&mut self, sel: ListSel) -> &mut LruList {
        if sel.part == PartId::FREELIST {
            &mut self.free
        } else {
            let lists = &mut self.parts[sel.part.0 as usize];
            match sel.kind {
                ListKind::Clean => &mut lists.clean,
                ListKind::Dirty => &mut lists.dirty,
            }
        }
    }

    /// Links `line` at the head of the selected list. On a tracked list a
    /// newly linked head starts hot, which keeps the hot run a contiguous
    /// prefix; the balancer demotes from the boundary to restore the ratio.
    pub(crate) fn push_head(&mut self, sel: ListSel, line: LineId) {
        assert_ne!(line, END_MARKER);
        let (curr_head, track_hot) = {
            let l = self.list(sel);
            (l.head, l.track_hot)
        };

        if curr_head == END_MARKER {
            {
                let n = self.node_mut(line);
                n.hot = false;
                n.prev = END_MARKER;
                n.next = END_MARKER;
            }
            let l = self.list_mut(sel);
            debug_assert_eq!(l.count, 0);
            l.head = line;
            l.tail = line;
            l.count = 1;
        } else {
            let head_was_hot = self.node(curr_head).hot;
            {
                let n = self.node_mut(line);
                n.next = curr_head;
                n.prev = END_MARKER;
                n.hot = track_hot;
            }
            self.node_mut(curr_head).prev = line;
            let l = self.list_mut(sel);
            if track_hot {
                if !head_was_hot {
                    l.hot_boundary = line;
                }
                l.hot_count += 1;
            }
            l.head = line;
            l.count += 1;
        }
    }

    /// Unlinks `line` from the selected list. Four constant-time cases:
    /// sole node, head, tail, interior.
    pub(crate) fn unlink(&mut self, sel: ListSel, line: LineId) {
        assert_ne!(line, END_MARKER);
        let (was_hot, prev, next) = {
            let n = self.node(line);
            (n.hot, n.prev, n.next)
        };
        let (is_head, is_tail) = {
            let l = self.list(sel);
            (l.head == line, l.tail == line)
        };

        if was_hot {
            let l = self.list_mut(sel);
            assert!(l.hot_count > 0, "hot count underflow");
            l.hot_count -= 1;
        }

        if is_head && is_tail {
            {
                let n = self.node_mut(line);
                n.prev = END_MARKER;
                n.next = END_MARKER;
            }
            let l = self.list_mut(sel);
            l.head = END_MARKER;
            l.tail = END_MARKER;
            l.hot_boundary = END_MARKER;
            assert_eq!(l.hot_count, 0);
        } else if is_head {
            assert_ne!(next, END_MARKER);
            {
                let l = self.list_mut(sel);
                if l.hot_boundary == line {
                    assert_eq!(l.hot_count, 0);
                    l.hot_boundary = END_MARKER;
                }
                l.head = next;
            }
            self.node_mut(line).next = END_MARKER;
            self.node_mut(next).prev = END_MARKER;
        } else if is_tail {
            assert_ne!(prev, END_MARKER);
            {
                let l = self.list_mut(sel);
                // boundary can sit on the tail when the whole list is hot
                if l.hot_boundary == line {
                    assert!(l.hot_count > 0);
                    l.hot_boundary = prev;
                }
                l.tail = prev;
            }
            self.node_mut(line).prev = END_MARKER;
            self.node_mut(prev).next = END_MARKER;
        } else {
            assert_ne!(prev, END_MARKER);
            assert_ne!(next, END_MARKER);
            {
                let l = self.list_mut(sel);
                if l.hot_boundary == line {
                    assert!(l.hot_count > 0);
                    l.hot_boundary = prev;
                }
            }
            self.node_mut(prev).next = next;
            self.node_mut(next).prev = prev;
            {
                let n = self.node_mut(line);
                n.prev = END_MARKER;
                n.next = END_MARKER;
            }
        }

        self.node_mut(line).hot = false;
        let l = self.list_mut(sel);
        assert!(l.count > 0, "list count underflow");
        l.count -= 1;
    }

    /// Nudges `hot_count` one step toward `count / hot_ratio`. Walks at most
    /// one node from the current boundary, never the whole list; hot entries
    /// stay clustered at the head because insertion and demotion both operate
    /// on the cluster's edges.
    pub(crate) fn balance(&mut self, sel: ListSel, hot_ratio: u32) {
        let (track_hot, target, hot_count, head, boundary) = {
            let l = self.list(sel);
            (
                l.track_hot,
                l.count / hot_ratio,
                l.hot_count,
                l.head,
                l.hot_boundary,
            )
        };
        if !track_hot || target == hot_count {
            return;
        }

        if hot_count == 0 {
            self.node_mut(head).hot = true;
            let l = self.list_mut(sel);
            l.hot_boundary = head;
            l.hot_count = 1;
            return;
        }

        assert_ne!(boundary, END_MARKER);
        if target > hot_count {
            let next = self.node(boundary).next;
            assert_ne!(next, END_MARKER);
            self.node_mut(next).hot = true;
            let l = self.list_mut(sel);
            l.hot_count += 1;
            l.hot_boundary = next;
        } else if boundary == head {
            self.node_mut(boundary).hot = false;
            let l = self.list_mut(sel);
            l.hot_count = 0;
            l.hot_boundary = END_MARKER;
        } else {
            let prev = self.node(boundary).prev;
            assert_ne!(prev, END_MARKER);
            self.node_mut(boundary).hot = false;
            let l = self.list_mut(sel);
            l.hot_count -= 1;
            l.hot_boundary = prev;
        }
    }
}
