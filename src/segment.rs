//! Segments and the segment list.
//!
//! A document's logical byte stream is an ordered sequence of segments, each
//! a contiguous run taken either from the original file source or from an
//! edit buffer. The list is a doubly-linked list whose nodes live in a
//! [`slab::Slab`] arena; node keys are stable across splices, so a cached
//! last-touched node gives O(1) lookups for the local access patterns edits
//! produce. No zero-length node is ever kept: a fully consumed segment is
//! unlinked.

use std::cell::Cell;

use slab::Slab;

/// Which kind of store a segment's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    File,
    Memory,
}

/// Where a segment's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreRef {
    /// A file source, keyed into the repository's source table.
    File { source: usize },
    /// An edit buffer, keyed into the repository's buffer table. `owned` is
    /// true when the buffer belongs to the document holding the segment, in
    /// which case removal releases the covered bytes.
    Memory { buffer: usize, owned: bool },
}

/// A contiguous run of bytes in the document's logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub(crate) store: StoreRef,
    /// Offset of the run within its backing store.
    pub offset: u64,
    /// Length of the run. Always greater than zero.
    pub length: u64,
}

impl Segment {
    pub fn kind(&self) -> SegmentKind {
        match self.store {
            StoreRef::File { .. } => SegmentKind::File,
            StoreRef::Memory { .. } => SegmentKind::Memory,
        }
    }

    /// True when `other` continues this segment's run in the same store.
    fn abuts(&self, other: &Segment) -> bool {
        self.store == other.store && self.offset + self.length == other.offset
    }
}

struct Node {
    segment: Segment,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct SegmentList {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
    total_len: u64,
    /// Last-touched node and its logical start offset.
    cache: Cell<Option<(usize, u64)>>,
}

impl SegmentList {
    pub fn new() -> Self {
        SegmentList {
            nodes: Slab::new(),
            head: None,
            tail: None,
            total_len: 0,
            cache: Cell::new(None),
        }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn segment(&self, key: usize) -> &Segment {
        &self.nodes[key].segment
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        let mut next = self.head;
        std::iter::from_fn(move || {
            let key = next?;
            let node = &self.nodes[key];
            next = node.next;
            Some(&node.segment)
        })
    }

    /// Find the node containing `position` and the offset within it.
    ///
    /// The last-touched node is remembered, so a sequence of nearby positions
    /// walks at most a few links rather than scanning from the head.
    ///
    /// # Panics
    ///
    /// Panics if `position >= total_len`.
    pub fn locate(&self, position: u64) -> (usize, u64) {
        assert!(position < self.total_len);
        let (mut key, mut start) = match self.cache.get() {
            Some((key, start)) if self.nodes.contains(key) => (key, start),
            // UNWRAP: total_len > 0 implies a head node exists.
            _ => (self.head.unwrap(), 0),
        };
        // Walk backward while the position is before the current node.
        while position < start {
            // UNWRAP: position >= 0 and the head starts at 0.
            key = self.nodes[key].prev.unwrap();
            start -= self.nodes[key].segment.length;
        }
        // Walk forward while the position is past the current node.
        while position >= start + self.nodes[key].segment.length {
            start += self.nodes[key].segment.length;
            // UNWRAP: position < total_len, so a next node exists.
            key = self.nodes[key].next.unwrap();
        }
        self.cache.set(Some((key, start)));
        (key, position - start)
    }

    /// Guarantee a node boundary exists exactly at `position` by splitting
    /// the owning node in two. The ends of the list are already boundaries.
    pub fn split_at(&mut self, position: u64) {
        if position == 0 || position == self.total_len {
            return;
        }
        let (key, inner) = self.locate(position);
        if inner == 0 {
            return;
        }
        let right = {
            let segment = &mut self.nodes[key].segment;
            let right = Segment {
                store: segment.store,
                offset: segment.offset + inner,
                length: segment.length - inner,
            };
            segment.length = inner;
            right
        };
        self.link_after(key, right);
    }

    /// Splice `segment` in at `position`. A boundary must already exist at
    /// `position` (see [`Self::split_at`]); contiguous memory neighbors are
    /// merged eagerly so the segment count stays bounded.
    pub fn insert_at(&mut self, position: u64, segment: Segment) {
        debug_assert!(segment.length > 0);
        debug_assert!(position <= self.total_len);
        self.total_len += segment.length;

        if position == self.total_len - segment.length {
            // Appending at the end.
            if let Some(tail) = self.tail {
                if self.nodes[tail].segment.abuts(&segment) {
                    self.nodes[tail].segment.length += segment.length;
                    self.cache.set(None);
                    return;
                }
                self.link_after(tail, segment);
            } else {
                let key = self.nodes.insert(Node {
                    segment,
                    prev: None,
                    next: None,
                });
                self.head = Some(key);
                self.tail = Some(key);
            }
            self.cache.set(None);
            return;
        }

        let (at, inner) = self.locate(position);
        debug_assert_eq!(inner, 0, "insert position must fall on a boundary");

        match self.nodes[at].prev {
            Some(prev) if self.nodes[prev].segment.abuts(&segment) => {
                self.nodes[prev].segment.length += segment.length;
                self.merge_with_next(prev);
            }
            Some(prev) => {
                self.link_after(prev, segment);
                // UNWRAP: link_after placed a node after `prev`.
                let new = self.nodes[prev].next.unwrap();
                self.merge_with_next(new);
            }
            None => {
                let key = self.nodes.insert(Node {
                    segment,
                    prev: None,
                    next: Some(at),
                });
                self.nodes[at].prev = Some(key);
                self.head = Some(key);
                self.merge_with_next(key);
            }
        }
        self.cache.set(None);
    }

    /// Unlink the nodes covering `[start, start + length)` and return their
    /// segments. Boundaries must already exist at both ends of the range.
    pub fn remove_range(&mut self, start: u64, length: u64) -> Vec<Segment> {
        if length == 0 {
            return Vec::new();
        }
        debug_assert!(start + length <= self.total_len);
        let (first, inner) = self.locate(start);
        debug_assert_eq!(inner, 0, "removal start must fall on a boundary");
        self.cache.set(None);

        let mut removed = Vec::new();
        let mut consumed = 0;
        let mut cursor = Some(first);
        while consumed < length {
            // UNWRAP: boundaries exist at both ends, so the range is covered
            // by whole nodes.
            let key = cursor.unwrap();
            let node = self.nodes.remove(key);
            debug_assert!(node.segment.length <= length - consumed);
            consumed += node.segment.length;
            cursor = node.next;
            match node.prev {
                Some(prev) => self.nodes[prev].next = node.next,
                None => self.head = node.next,
            }
            match node.next {
                Some(next) => self.nodes[next].prev = node.prev,
                None => self.tail = node.prev,
            }
            removed.push(node.segment);
        }
        self.total_len -= length;

        // The removal may have brought two contiguous memory runs together.
        if let Some(next) = cursor {
            if let Some(prev) = self.nodes[next].prev {
                self.merge_with_next(prev);
            }
        }
        removed
    }

    /// Compaction pass: merge every adjacent pair of contiguous memory
    /// segments in one walk.
    pub fn merge_adjacent(&mut self) {
        let mut cursor = self.head;
        while let Some(key) = cursor {
            if !self.merge_with_next(key) {
                cursor = self.nodes[key].next;
            }
        }
        self.cache.set(None);
    }

    /// Merge the node after `key` into `key` if their runs are contiguous.
    fn merge_with_next(&mut self, key: usize) -> bool {
        let Some(next) = self.nodes[key].next else {
            return false;
        };
        let next_segment = self.nodes[next].segment;
        if !self.nodes[key].segment.abuts(&next_segment) {
            return false;
        }
        let node = self.nodes.remove(next);
        self.nodes[key].segment.length += node.segment.length;
        self.nodes[key].next = node.next;
        match node.next {
            Some(after) => self.nodes[after].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.cache.set(None);
        true
    }

    fn link_after(&mut self, key: usize, segment: Segment) {
        let next = self.nodes[key].next;
        let new = self.nodes.insert(Node {
            segment,
            prev: Some(key),
            next,
        });
        self.nodes[key].next = Some(new);
        match next {
            Some(next) => self.nodes[next].prev = Some(new),
            None => self.tail = Some(new),
        }
    }

    /// Drop every node. The caller releases any buffer ranges first.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        self.total_len = 0;
        self.cache.set(None);
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let mut sum = 0;
        let mut count = 0;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            assert!(node.segment.length > 0, "zero-length node");
            assert_eq!(node.prev, prev);
            sum += node.segment.length;
            count += 1;
            prev = Some(key);
            cursor = node.next;
        }
        assert_eq!(self.tail, prev);
        assert_eq!(sum, self.total_len);
        assert_eq!(count, self.nodes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::{Segment, SegmentList, StoreRef};

    fn file_seg(offset: u64, length: u64) -> Segment {
        Segment {
            store: StoreRef::File { source: 0 },
            offset,
            length,
        }
    }

    fn mem_seg(offset: u64, length: u64) -> Segment {
        Segment {
            store: StoreRef::Memory {
                buffer: 0,
                owned: true,
            },
            offset,
            length,
        }
    }

    fn shape(list: &SegmentList) -> Vec<(u64, u64)> {
        list.iter().map(|s| (s.offset, s.length)).collect()
    }

    #[test]
    fn split_and_locate() {
        let mut list = SegmentList::new();
        list.insert_at(0, file_seg(0, 100));
        list.split_at(40);
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 40), (40, 60)]);

        // Splitting at an existing boundary is a no-op.
        list.split_at(40);
        list.split_at(0);
        list.split_at(100);
        assert_eq!(shape(&list), vec![(0, 40), (40, 60)]);

        let (key, inner) = list.locate(39);
        assert_eq!((list.segment(key).offset, inner), (0, 39));
        let (key, inner) = list.locate(40);
        assert_eq!((list.segment(key).offset, inner), (40, 0));
        let (key, inner) = list.locate(99);
        assert_eq!((list.segment(key).offset, inner), (40, 59));
    }

    #[test]
    fn locate_walks_backward_from_cache() {
        let mut list = SegmentList::new();
        for i in 0..10 {
            list.insert_at(i * 10, file_seg(i * 10, 10));
        }
        list.locate(95);
        let (key, inner) = list.locate(5);
        assert_eq!((list.segment(key).offset, inner), (0, 5));
    }

    #[test]
    fn insert_in_middle_and_merge() {
        let mut list = SegmentList::new();
        list.insert_at(0, file_seg(0, 100));
        list.split_at(50);
        list.insert_at(50, mem_seg(0, 10));
        list.assert_invariants();
        assert_eq!(list.total_len(), 110);
        assert_eq!(shape(&list), vec![(0, 50), (0, 10), (50, 50)]);

        // A contiguous memory run inserted right after merges eagerly.
        list.split_at(60);
        list.insert_at(60, mem_seg(10, 5));
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 50), (0, 15), (50, 50)]);

        // Non-contiguous memory does not merge.
        list.split_at(65);
        list.insert_at(65, mem_seg(100, 5));
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 50), (0, 15), (100, 5), (50, 50)]);
    }

    #[test]
    fn append_merges_with_tail() {
        let mut list = SegmentList::new();
        list.insert_at(0, mem_seg(0, 10));
        list.insert_at(10, mem_seg(10, 10));
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 20)]);
    }

    #[test]
    fn remove_range_unlinks_and_rejoins() {
        let mut list = SegmentList::new();
        list.insert_at(0, mem_seg(0, 100));
        list.split_at(40);
        list.split_at(60);
        let removed = list.remove_range(40, 20);
        list.assert_invariants();
        assert_eq!(removed, vec![mem_seg(40, 20)]);
        assert_eq!(list.total_len(), 80);

        // [0, 40) and [60, 100) are not contiguous, so two nodes remain.
        assert_eq!(shape(&list), vec![(0, 40), (60, 40)]);
    }

    #[test]
    fn remove_range_merges_rejoined_memory() {
        let mut list = SegmentList::new();
        list.insert_at(0, mem_seg(0, 30));
        list.split_at(10);
        list.split_at(20);
        // Replace the middle third with file data, then remove it again: the
        // two memory runs become contiguous and merge back into one node.
        let removed = list.remove_range(10, 10);
        assert_eq!(removed, vec![mem_seg(10, 10)]);
        list.insert_at(10, file_seg(500, 10));
        assert_eq!(shape(&list), vec![(0, 10), (500, 10), (20, 10)]);

        list.remove_range(10, 10);
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 10), (20, 10)]);
        // Not merged: offsets 0..10 and 20..30 are not contiguous.

        list.clear();
        list.insert_at(0, mem_seg(0, 30));
        list.split_at(10);
        list.split_at(20);
        list.remove_range(10, 10);
        list.insert_at(10, mem_seg(10, 10));
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 30)]);
    }

    #[test]
    fn remove_everything_empties_the_list() {
        let mut list = SegmentList::new();
        list.insert_at(0, file_seg(0, 50));
        list.split_at(25);
        let removed = list.remove_range(0, 50);
        list.assert_invariants();
        assert_eq!(removed.len(), 2);
        assert!(list.is_empty());
        assert_eq!(list.total_len(), 0);
    }

    #[test]
    fn merge_adjacent_pass() {
        let mut list = SegmentList::new();
        list.insert_at(0, mem_seg(0, 10));
        list.insert_at(10, file_seg(0, 10));
        list.split_at(5);
        list.remove_range(5, 5);
        // [0,5) mem + file; splitting left two mem halves apart from the
        // file run; force a fragmented shape and compact it.
        list.insert_at(5, mem_seg(5, 5));
        list.merge_adjacent();
        list.assert_invariants();
        assert_eq!(shape(&list), vec![(0, 10), (0, 10)]);
    }
}
