use std::ops::Range;

use spin::{Mutex, MutexGuard};

use crate::config::{AllocKind, PageSize, PlacementRule};
use crate::error::{RouteError, RouteResult};
use crate::extents::{ExtentError, Extents};

/// A reserved, contiguous virtual address arena backing one [`PlacementRule`].
///
/// ```text
///  base_address                                     base_address + length
///  +------------------------------------------------------------+
///  |  floor  |       used        |           available           |   heap region
///  +------------------------------------------------------------+
///
///  +------------------------------------------------------------+
///  | live |  hole  | live |             hole                     |   anonymous region
///  +------------------------------------------------------------+
/// ```
///
/// The span and the page size never change once the region is created. What
/// changes is the [`RegionState`], which only the router touches and always
/// under the region's own lock.
pub struct Region {
    rule: PlacementRule,
    base: usize,
    length: usize,
    page_size: PageSize,
    backing: Option<Backing>,
    state: Mutex<RegionState>,
}

/// The OS mapping a region owns and has to give back on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backing {
    pub addr: usize,
    pub len: usize,
}

pub(crate) struct RegionState {
    /// Bytes handed out. For heap regions this is the distance between the
    /// effective start (`base + floor`) and the break when the break is inside
    /// the region.
    pub used: usize,
    /// Heap regions only: prefix ceded to the fallback by a split.
    pub floor: usize,
    /// Anonymous regions only: live slices.
    pub extents: Extents,
    /// Some page may carry a protection other than read/write.
    pub protected: bool,
}

impl Region {
    /// A region carved out of the heap arena. The arena owns the mapping.
    pub(crate) fn heap(rule: PlacementRule, base: usize, page_size: PageSize) -> Self {
        Self::new(rule, base, page_size, None, 0)
    }

    /// A standalone region for anonymous mappings with room for
    /// `extent_slots` live slices.
    pub(crate) fn anonymous(
        rule: PlacementRule,
        backing: Backing,
        page_size: PageSize,
        extent_slots: usize,
    ) -> Self {
        Self::new(rule, backing.addr, page_size, Some(backing), extent_slots)
    }

    fn new(
        rule: PlacementRule,
        base: usize,
        page_size: PageSize,
        backing: Option<Backing>,
        extent_slots: usize,
    ) -> Self {
        let length = rule.len();
        Self {
            rule,
            base,
            length,
            page_size,
            backing,
            state: Mutex::new(RegionState {
                used: 0,
                floor: 0,
                extents: Extents::with_capacity(extent_slots),
                protected: false,
            }),
        }
    }

    #[inline]
    pub fn rule(&self) -> &PlacementRule {
        &self.rule
    }

    #[inline]
    pub fn kind(&self) -> AllocKind {
        self.rule.kind
    }

    #[inline]
    pub fn base_address(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn end_address(&self) -> usize {
        self.base + self.length
    }

    /// Page size actually backing the region. Equal to the rule's unless the
    /// shim was started in dry run or degrade mode.
    #[inline]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[inline]
    pub fn backing(&self) -> Option<Backing> {
        self.backing
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end_address()
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    #[inline]
    pub fn encloses(&self, addr: usize, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.end_address())
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn floor(&self) -> usize {
        self.state.lock().floor
    }

    /// Live slices as absolute address ranges.
    pub fn live_slices(&self) -> Vec<Range<usize>> {
        self.state
            .lock()
            .extents
            .iter()
            .map(|r| self.base + r.start..self.base + r.end)
            .collect()
    }

    #[inline]
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock()
    }

    /// Places a `len` bytes slice, first fit. Returns `None` when the region
    /// can't take it: wrong granularity, not enough budget, fragmentation or
    /// a full slice table.
    pub(crate) fn try_place(&self, len: usize) -> RouteResult<Option<usize>> {
        if len == 0 || len % self.page_size.bytes() != 0 {
            return Ok(None);
        }

        let mut state = self.state.lock();
        if self.length - state.used < len {
            return Ok(None);
        }

        let Some(offset) = state.extents.find_hole(len, self.length) else {
            return Ok(None);
        };

        match state.extents.insert(offset..offset + len) {
            Ok(()) => {
                state.used += len;
                Ok(Some(self.base + offset))
            }
            Err(ExtentError::Full) => Ok(None),
            Err(ExtentError::Overlap) => Err(RouteError::Aliasing {
                addr: self.base + offset,
                len,
            }),
        }
    }

    /// Claims exactly `[addr, addr + len)`. With `replace` any live slice in the
    /// way is dropped first, which is what `MAP_FIXED` asks for.
    pub(crate) fn claim(&self, addr: usize, len: usize, replace: bool) -> RouteResult<()> {
        if !self.encloses(addr, len) || (addr - self.base) % self.page_size.bytes() != 0 {
            return Err(RouteError::InvalidArgument);
        }

        let offset = addr - self.base;
        let range = offset..offset + len;
        let mut state = self.state.lock();

        if !state.extents.is_free(&range) {
            if !replace {
                return Err(RouteError::AddressInUse { addr, len });
            }
            let freed = state
                .extents
                .remove(range.clone())
                .map_err(|_| RouteError::TableFull { region: self.base })?;
            state.used -= freed;
        }

        match state.extents.insert(range) {
            Ok(()) => {
                state.used += len;
                Ok(())
            }
            Err(ExtentError::Full) => Err(RouteError::TableFull { region: self.base }),
            Err(ExtentError::Overlap) => Err(RouteError::Aliasing { addr, len }),
        }
    }

    /// Releases whatever is live in `[addr, addr + len)`, clipped to the
    /// region. Returns the number of bytes released.
    pub(crate) fn release(&self, addr: usize, len: usize) -> RouteResult<usize> {
        let start = addr.max(self.base) - self.base;
        let end = addr.saturating_add(len).min(self.end_address()) - self.base;
        if start >= end {
            return Ok(0);
        }

        let mut state = self.state.lock();
        let freed = state
            .extents
            .remove(start..end)
            .map_err(|_| RouteError::TableFull { region: self.base })?;
        state.used -= freed;

        Ok(freed)
    }

    /// Grows the live slice ending at `addr + old_len` in place by `extra`
    /// bytes, if the following bytes are free and budget allows.
    pub(crate) fn extend(&self, addr: usize, old_len: usize, extra: usize) -> RouteResult<bool> {
        let end = addr + old_len;
        if extra % self.page_size.bytes() != 0 || !self.encloses(end, extra) {
            return Ok(false);
        }

        let offset = end - self.base;
        let mut state = self.state.lock();
        if self.length - state.used < extra || !state.extents.is_free(&(offset..offset + extra)) {
            return Ok(false);
        }

        match state.extents.insert(offset..offset + extra) {
            Ok(()) => {
                state.used += extra;
                Ok(true)
            }
            Err(ExtentError::Full) => Ok(false),
            Err(ExtentError::Overlap) => Err(RouteError::Aliasing {
                addr: end,
                len: extra,
            }),
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.rule.kind)
            .field("line", &self.rule.line)
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &self.length)
            .field("page_size", &self.page_size)
            .finish()
    }
}
