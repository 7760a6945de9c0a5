use std::ops::Range;

/// Table of the live slices handed out from one anonymous region.
///
/// Offsets are relative to the region base. The table is kept sorted and
/// adjacent slices are merged, so it describes exactly which bytes of the
/// region are mapped by the program:
///
/// ```text
///  region   +--------+------+------------+--------+-------------+
///           | live   | hole |    live    |  hole  |    live     |
///           +--------+------+------------+--------+-------------+
///  table    [0..a)          [b..c)                [d..e)
/// ```
///
/// The capacity is fixed when the region is created. Growing the table would
/// mean calling the allocator from inside an intercepted `mmap`, so instead a
/// full table makes the region refuse new slices.
#[derive(Debug)]
pub(crate) struct Extents {
    live: Vec<Range<usize>>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtentError {
    /// The slice overlaps a live one.
    Overlap,
    /// No slot left to record the slice.
    Full,
}

impl Extents {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            live: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.live.len() >= self.capacity
    }

    /// Bytes covered by live slices.
    pub fn live_bytes(&self) -> usize {
        self.live.iter().map(|r| r.end - r.start).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<usize>> {
        self.live.iter()
    }

    /// First hole of at least `len` bytes below `limit`, scanning from the
    /// start of the region (first fit).
    pub fn find_hole(&self, len: usize, limit: usize) -> Option<usize> {
        let mut start = 0;

        for range in &self.live {
            if range.start - start >= len {
                return Some(start);
            }
            start = range.end;
        }

        (limit.checked_sub(start)? >= len).then_some(start)
    }

    /// Whether no live slice touches `range`.
    pub fn is_free(&self, range: &Range<usize>) -> bool {
        !self
            .live
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
    }

    /// Records `range` as live.
    pub fn insert(&mut self, range: Range<usize>) -> Result<(), ExtentError> {
        if range.start >= range.end {
            return Ok(());
        }
        if !self.is_free(&range) {
            return Err(ExtentError::Overlap);
        }

        let idx = self.live.partition_point(|r| r.start < range.start);
        let joins_prev = idx > 0 && self.live[idx - 1].end == range.start;
        let joins_next = idx < self.live.len() && self.live[idx].start == range.end;

        match (joins_prev, joins_next) {
            (true, true) => {
                self.live[idx - 1].end = self.live[idx].end;
                self.live.remove(idx);
            }
            (true, false) => self.live[idx - 1].end = range.end,
            (false, true) => self.live[idx].start = range.start,
            (false, false) => {
                if self.is_full() {
                    return Err(ExtentError::Full);
                }
                self.live.insert(idx, range);
            }
        }

        Ok(())
    }

    /// Removes every live byte inside `range`, splitting a slice when the
    /// range falls in its middle. Returns the number of bytes released.
    pub fn remove(&mut self, range: Range<usize>) -> Result<usize, ExtentError> {
        let splits = self
            .live
            .iter()
            .any(|r| r.start < range.start && range.end < r.end);
        if splits && self.is_full() {
            return Err(ExtentError::Full);
        }

        let mut freed = 0;
        let mut idx = 0;
        while idx < self.live.len() {
            let cur = self.live[idx].clone();
            if cur.end <= range.start {
                idx += 1;
                continue;
            }
            if cur.start >= range.end {
                break;
            }

            freed += cur.end.min(range.end) - cur.start.max(range.start);

            match (cur.start < range.start, range.end < cur.end) {
                (true, true) => {
                    self.live[idx].end = range.start;
                    self.live.insert(idx + 1, range.end..cur.end);
                    break;
                }
                (true, false) => {
                    self.live[idx].end = range.start;
                    idx += 1;
                }
                (false, true) => {
                    self.live[idx].start = range.end;
                    break;
                }
                (false, false) => {
                    self.live.remove(idx);
                }
            }
        }

        Ok(freed)
    }
}
