//! Message header slot allocator
//!
//! Every receive endpoint needs one header slot per message slot of its
//! buffer, handed out as a contiguous range. Slot 0 is reserved for the
//! tile's own privileged channel.
//!
//! ## Design
//!
//! A bump pointer with a fixed ceiling, plus a free list of released ranges.
//! Released ranges are kept sorted and coalesced; allocation is first-fit
//! over the free list before the bump pointer advances. A range released at
//! the top lowers the bump pointer again.

/// Header slots reserved for the tile's own channel
pub const RESERVED_HEADERS: u32 = 1;

#[derive(Debug, Clone)]
pub struct HeaderAlloc {
    count: u32,
    next: u32,
    /// Released ranges as (start, len), sorted by start
    free: Vec<(u32, u32)>,
}

impl HeaderAlloc {
    /// Allocator for `count` slots, with the reserved ones already taken
    pub fn new(count: u32) -> Self {
        Self {
            count,
            next: RESERVED_HEADERS.min(count),
            free: Vec::new(),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Slots that can still be allocated (possibly fragmented)
    pub fn available(&self) -> u32 {
        self.count - self.next + self.free.iter().map(|&(_, len)| len).sum::<u32>()
    }

    /// True if a range of `num` slots can be allocated right now
    pub fn can_alloc(&self, num: u32) -> bool {
        num > 0 && (self.free.iter().any(|&(_, len)| len >= num) || self.count - self.next >= num)
    }

    /// Allocate `num` contiguous slots and return the first one
    ///
    /// Returns `None` if no range of that size is left; nothing is allocated
    /// in that case.
    pub fn alloc(&mut self, num: u32) -> Option<u16> {
        if num == 0 {
            return None;
        }
        if let Some(idx) = self.free.iter().position(|&(_, len)| len >= num) {
            let (start, len) = self.free[idx];
            if len == num {
                self.free.remove(idx);
            } else {
                self.free[idx] = (start + num, len - num);
            }
            return Some(start as u16);
        }
        if self.count - self.next < num {
            return None;
        }
        let start = self.next;
        self.next += num;
        Some(start as u16)
    }

    /// Release a range previously returned by [`alloc`](Self::alloc)
    ///
    /// A range that is already (partly) free is ignored, so releasing twice
    /// cannot hand out the same slots to two receive gates.
    pub fn free(&mut self, start: u16, num: u32) {
        let start = start as u32;
        if num == 0 || start < RESERVED_HEADERS || start + num > self.next {
            log::warn!(target: "tilemux::eps", "ignoring bogus header release {}+{}", start, num);
            return;
        }

        let idx = self.free.partition_point(|&(s, _)| s < start);
        let prev_overlaps = idx > 0 && {
            let (ps, pl) = self.free[idx - 1];
            ps + pl > start
        };
        let next_overlaps = self.free.get(idx).map_or(false, |&(ns, _)| start + num > ns);
        if prev_overlaps || next_overlaps {
            log::warn!(target: "tilemux::eps", "ignoring double header release {}+{}", start, num);
            return;
        }
        self.free.insert(idx, (start, num));

        // merge with the successor, then with the predecessor
        if idx + 1 < self.free.len() {
            let (s, l) = self.free[idx];
            let (ns, nl) = self.free[idx + 1];
            if s + l == ns {
                self.free[idx] = (s, l + nl);
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (ps, pl) = self.free[idx - 1];
            let (s, l) = self.free[idx];
            if ps + pl == s {
                self.free[idx - 1] = (ps, pl + l);
                self.free.remove(idx);
            }
        }

        while let Some(&(s, l)) = self.free.last() {
            if s + l != self.next {
                break;
            }
            self.next = s;
            self.free.pop();
        }
    }
}
