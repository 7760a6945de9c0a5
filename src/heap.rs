//! The program break.
//!
//! The heap is one logical byte range starting at the arena base. Every
//! offset of it belongs either to a heap region or to the fallback:
//!
//! ```text
//!  offset 0                                        limit
//!  +-------+---------------+--------+------+---------------+- - - - - - -
//!  |  gap  |   region 0    |  gap   | ceded|   region 1    |  beyond the
//!  |  (fb) |               |  (fb)  | (fb) |               |  arena (fb)
//!  +-------+---------------+--------+------+---------------+- - - - - - -
//!                                   ^ start_1     ^ start_1 + floor_1 .. end_1
//! ```
//!
//! Regions are backed from start-up. Fallback territory is backed lazily: a
//! fallback span `[a, b)` with granule `g` has `[a, align_up(cursor, g))` mapped
//! (clamped to the span), so what to map or release on every move follows
//! from the cursor alone. Gaps and the space beyond the arena use default
//! pages; a ceded prefix keeps the granule of the region it was taken from so
//! whole huge pages are replaced at once.
//!
//! Nothing here allocates. Growth can come from `malloc` itself.

use log::warn;
use nix::errno::Errno;
use spin::Mutex;

use crate::config::PageSize;
use crate::error::{RouteError, RouteResult};
use crate::fallback::FallbackAllocator;
use crate::kernel::PlatformMemory;
use crate::region::Region;
use crate::reserve::HeapArena;
use crate::settings::HeapSpill;
use crate::utils::align_up;

const BASE_PAGE: usize = PageSize::Base4K.bytes();

/// What a single break move did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapMove {
    pub old_break: usize,
    pub new_break: usize,
    /// Bytes of the move served by heap regions.
    pub region_bytes: usize,
    /// Bytes of the move in fallback territory.
    pub fallback_bytes: usize,
    /// The move crossed from one owner to another.
    pub split: bool,
}

struct CursorState {
    offset: usize,
    /// Index of the first region ending after `offset`.
    segment: usize,
}

/// Logical break offset, the only globally serialized state of the router.
///
/// Lock order: the cursor first, then region locks.
pub(crate) struct HeapCursor {
    state: Mutex<CursorState>,
}

/// A piece of fallback territory, in logical offsets.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    granule: usize,
    reserved: bool,
}

impl Span {
    /// Part of the span backed while the break sits at `offset`.
    #[inline]
    fn backed_to(&self, offset: usize) -> usize {
        align_up(offset, self.granule).clamp(self.start, self.end)
    }
}

/// Fallback span `k` of the arena. For `n` regions there are `2n + 1` of
/// them: the gap before region `i` is `2i`, its ceded prefix `2i + 1` and the
/// space beyond the arena is `2n`.
fn fallback_span(arena: &HeapArena, k: usize) -> Span {
    let regions = arena.regions();
    let n = regions.len();

    if k == 2 * n {
        return Span {
            start: arena.limit(),
            end: usize::MAX,
            granule: BASE_PAGE,
            reserved: false,
        };
    }

    let region = &regions[k / 2];
    let start = region.rule().range.start;
    if k % 2 == 0 {
        let prev_end = if k == 0 {
            0
        } else {
            regions[k / 2 - 1].rule().range.end
        };
        Span {
            start: prev_end,
            end: start,
            granule: BASE_PAGE,
            reserved: true,
        }
    } else {
        Span {
            start,
            end: start + region.floor(),
            granule: region.page_size().bytes(),
            reserved: true,
        }
    }
}

/// Logical span a heap region serves: `[start + floor, end)`.
#[inline]
fn owned(region: &Region) -> (usize, usize) {
    let range = &region.rule().range;
    (range.start + region.floor(), range.end)
}

#[inline]
fn overlap(a: (usize, usize), b: (usize, usize)) -> usize {
    b.1.min(a.1).saturating_sub(a.0.max(b.0))
}

/// Everything a break move needs besides the cursor.
pub(crate) struct HeapBackends<'a> {
    pub arena: &'a HeapArena,
    pub platform: &'a dyn PlatformMemory,
    pub fallback: &'a dyn FallbackAllocator,
    pub spill: HeapSpill,
}

impl HeapCursor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CursorState {
                offset: 0,
                segment: 0,
            }),
        }
    }

    /// Current break as a logical offset.
    pub fn offset(&self) -> usize {
        self.state.lock().offset
    }

    /// Moves the break up by `delta` bytes.
    pub fn grow(&self, env: &HeapBackends<'_>, delta: usize) -> RouteResult<HeapMove> {
        grow_locked(&mut self.state.lock(), env, delta)
    }

    /// Moves the break down by `delta` bytes.
    pub fn shrink(&self, env: &HeapBackends<'_>, delta: usize) -> RouteResult<HeapMove> {
        shrink_locked(&mut self.state.lock(), env, delta)
    }

    /// Moves the break to the logical `offset`, whichever way that is.
    pub fn move_to(&self, env: &HeapBackends<'_>, offset: usize) -> RouteResult<HeapMove> {
        let mut state = self.state.lock();
        let from = state.offset;
        if offset >= from {
            grow_locked(&mut state, env, offset - from)
        } else {
            shrink_locked(&mut state, env, from - offset)
        }
    }
}

fn grow_locked(
    state: &mut CursorState,
    env: &HeapBackends<'_>,
    delta: usize,
) -> RouteResult<HeapMove> {
    let arena = env.arena;
    let from = state.offset;
    let to = from
        .checked_add(delta)
        .filter(|to| align_up(*to, BASE_PAGE).checked_add(arena.base()).is_some())
        .ok_or(RouteError::OutOfMemory(Errno::ENOMEM))?;

    let regions = arena.regions();

    // Fast path: the region holding the cursor takes the whole delta.
    if let Some(region) = regions.get(state.segment) {
        let (start, end) = owned(region);
        if start <= from && to <= end {
            region.lock_state().used += delta;
            state.offset = to;
            return Ok(HeapMove {
                old_break: arena.base() + from,
                new_break: arena.base() + to,
                region_bytes: delta,
                fallback_bytes: 0,
                split: false,
            });
        }
    }

    if env.spill == HeapSpill::Fallback {
        cede(regions, from, to);
    }

    map_fallback(arena, env.fallback, from, to)?;

    let (region_bytes, owners) = served_by_regions(regions, from, to);
    refresh_used(regions, to);

    state.offset = to;
    state.segment = arena.region_index_after(to);

    let fallback_bytes = delta - region_bytes;
    Ok(HeapMove {
        old_break: arena.base() + from,
        new_break: arena.base() + to,
        region_bytes,
        fallback_bytes,
        split: owners > 1 || (owners == 1 && fallback_bytes > 0),
    })
}

fn shrink_locked(
    state: &mut CursorState,
    env: &HeapBackends<'_>,
    delta: usize,
) -> RouteResult<HeapMove> {
    let arena = env.arena;
    let from = state.offset;
    let to = from.checked_sub(delta).ok_or(RouteError::InvalidShrink {
        requested: delta,
        available: from,
    })?;

    let regions = arena.regions();

    for k in 0..=2 * regions.len() {
        let span = fallback_span(arena, k);
        let lo = span.backed_to(to);
        let hi = span.backed_to(from);
        if hi <= lo {
            continue;
        }
        if let Err(errno) = env
            .fallback
            .shrink_heap(arena.base() + lo, hi - lo, span.reserved)
        {
            warn!(
                "fallback kept heap pages {:#x}+{:#x}: {}",
                arena.base() + lo,
                hi - lo,
                errno
            );
        }
    }

    // Whole region pages above the new break read back as zeros when the
    // break comes up again, as with the kernel's own heap.
    for region in regions {
        let (start, end) = owned(region);
        let page = region.page_size().bytes();
        let lo = align_up(to.max(start), page);
        let hi = from.min(end);
        if hi > lo && overlap((start, end), (to, from)) > 0 {
            if let Err(e) = env.platform.discard(arena.base() + lo, align_up(hi - lo, page)) {
                warn!("cannot discard heap pages {:#x}: {}", arena.base() + lo, e);
            }
        }
    }

    let (region_bytes, owners) = served_by_regions(regions, to, from);
    refresh_used(regions, to);

    state.offset = to;
    state.segment = arena.region_index_after(to);

    let fallback_bytes = delta - region_bytes;
    Ok(HeapMove {
        old_break: arena.base() + from,
        new_break: arena.base() + to,
        region_bytes,
        fallback_bytes,
        split: owners > 1 || (owners == 1 && fallback_bytes > 0),
    })
}

/// Bytes of `[lo, hi)` regions serve and how many regions that is.
fn served_by_regions(regions: &[Region], lo: usize, hi: usize) -> (usize, usize) {
    regions
        .iter()
        .map(|r| overlap(owned(r), (lo, hi)))
        .filter(|&n| n > 0)
        .fold((0, 0), |(bytes, owners), n| (bytes + n, owners + 1))
}

/// Rules whose span the move enters from below give up the prefix `[from, to)`
/// covers, rounded up to their own page size. Ceding is permanent.
///
/// Once the cursor sits inside a rule's span, in its ceded prefix or in what it
/// serves, the rule serves any further growth itself.
fn cede(regions: &[Region], from: usize, to: usize) {
    for region in regions {
        let range = &region.rule().range;
        if from >= range.start {
            continue;
        }

        let mut state = region.lock_state();
        if range.start + state.floor >= to {
            continue;
        }

        let page = region.page_size().bytes();
        state.floor = align_up(to - range.start, page).min(region.length());
    }
}

/// Backs the fallback part of `[from, to)`. On failure whatever was mapped
/// is released again.
fn map_fallback(
    arena: &HeapArena,
    fallback: &dyn FallbackAllocator,
    from: usize,
    to: usize,
) -> RouteResult<()> {
    let spans = 2 * arena.regions().len() + 1;

    for k in 0..spans {
        let span = fallback_span(arena, k);
        let lo = span.backed_to(from);
        let hi = span.backed_to(to);
        if hi <= lo {
            continue;
        }

        if let Err(errno) = fallback.grow_heap(arena.base() + lo, hi - lo, span.reserved) {
            for j in 0..k {
                let span = fallback_span(arena, j);
                let lo = span.backed_to(from);
                let hi = span.backed_to(to);
                if hi > lo {
                    if let Err(e) = fallback.shrink_heap(arena.base() + lo, hi - lo, span.reserved) {
                        warn!(
                            "rollback kept heap pages {:#x}+{:#x}: {}",
                            arena.base() + lo,
                            hi - lo,
                            e
                        );
                    }
                }
            }
            return Err(RouteError::OutOfMemory(errno));
        }
    }

    Ok(())
}

/// Recomputes `used` of every region from the break offset `brk`.
fn refresh_used(regions: &[Region], brk: usize) {
    for region in regions {
        let range = &region.rule().range;
        let mut state = region.lock_state();
        let start = range.start + state.floor;
        state.used = brk.saturating_sub(start).min(region.length() - state.floor);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse;
    use crate::reserve::{RoutingTable, ReserveOptions, reserve};
    use crate::sim::{FallbackCall, SimCall, SimulatedFallback, SimulatedMemory};

    const MB: usize = 1 << 20;

    /// 2MB pages over `[0, 4MB)`, a gap, default pages over `[8MB, 12MB)`.
    fn setup(fallback: SimulatedFallback) -> (Arc<SimulatedMemory>, RoutingTable, SimulatedFallback) {
        let platform = Arc::new(SimulatedMemory::new().with_huge_pages(PageSize::Huge2M, 2));
        let model = parse(
            "type,page_size,start_offset,end_offset\n\
             brk,2MB,0,4MB\n\
             brk,4KB,8MB,12MB\n",
        )
        .unwrap();
        let table = reserve(&model, platform.clone(), &ReserveOptions::default()).unwrap();
        (platform, table, fallback)
    }

    fn env<'a>(
        platform: &'a SimulatedMemory,
        table: &'a RoutingTable,
        fallback: &'a SimulatedFallback,
        spill: HeapSpill,
    ) -> HeapBackends<'a> {
        HeapBackends {
            arena: table.heap(),
            platform,
            fallback,
            spill,
        }
    }

    #[test]
    fn growth_inside_a_region_is_contiguous() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();
        let base = table.heap().base();

        let a = cursor.grow(&env, MB).unwrap();
        let b = cursor.grow(&env, 100).unwrap();
        let c = cursor.grow(&env, MB).unwrap();

        assert_eq!(a.old_break, base);
        assert_eq!(b.old_break, base + MB);
        assert_eq!(c.old_break, base + MB + 100);
        assert!(!c.split);
        assert_eq!(table.heap().regions()[0].used(), 2 * MB + 100);
        assert!(fallback.calls().is_empty());
    }

    #[test]
    fn crossing_a_boundary_splits_into_the_fallback() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();
        let base = table.heap().base();

        cursor.grow(&env, 3 * MB).unwrap();
        let moved = cursor.grow(&env, 2 * MB).unwrap();

        assert_eq!(moved.old_break, base + 3 * MB);
        assert_eq!(moved.region_bytes, MB);
        assert_eq!(moved.fallback_bytes, MB);
        assert!(moved.split);
        assert_eq!(table.heap().regions()[0].used(), 4 * MB);
        assert_eq!(
            fallback.calls(),
            vec![FallbackCall::GrowHeap {
                addr: base + 4 * MB,
                len: MB,
                reserved: true
            }]
        );
    }

    #[test]
    fn entering_the_next_rule_cedes_its_prefix() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();
        let base = table.heap().base();
        let next = &table.heap().regions()[1];

        cursor.grow(&env, 7 * MB).unwrap();
        cursor.grow(&env, 2 * MB).unwrap();

        assert_eq!(next.floor(), MB);
        assert_eq!(next.used(), 0);
        assert_eq!(
            &fallback.calls()[1..],
            &[
                FallbackCall::GrowHeap {
                    addr: base + 7 * MB,
                    len: MB,
                    reserved: true
                },
                FallbackCall::GrowHeap {
                    addr: base + 8 * MB,
                    len: MB,
                    reserved: true
                },
            ][..]
        );

        // From the edge of the ceded prefix on, the rule serves again.
        let moved = cursor.grow(&env, MB).unwrap();
        assert_eq!(moved.old_break, base + 9 * MB);
        assert!(!moved.split);
        assert_eq!(next.used(), MB);
        assert_eq!(fallback.calls().len(), 3);
    }

    #[test]
    fn follow_lets_each_rule_serve_its_span() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Follow);
        let cursor = HeapCursor::new();
        let base = table.heap().base();

        cursor.grow(&env, 7 * MB).unwrap();
        let moved = cursor.grow(&env, 2 * MB).unwrap();

        assert!(moved.split);
        assert_eq!(moved.region_bytes, MB);
        assert_eq!(table.heap().regions()[1].floor(), 0);
        assert_eq!(table.heap().regions()[1].used(), MB);
        assert_eq!(
            fallback.calls().last(),
            Some(&FallbackCall::GrowHeap {
                addr: base + 7 * MB,
                len: MB,
                reserved: true
            })
        );
    }

    #[test]
    fn growth_past_the_arena_never_clobbers() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Follow);
        let cursor = HeapCursor::new();
        let base = table.heap().base();

        cursor.grow(&env, 13 * MB).unwrap();

        assert_eq!(
            fallback.calls().last(),
            Some(&FallbackCall::GrowHeap {
                addr: base + 12 * MB,
                len: MB,
                reserved: false
            })
        );
    }

    #[test]
    fn shrink_releases_fallback_pieces_and_discards_pages() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();
        let base = table.heap().base();

        cursor.grow(&env, 5 * MB).unwrap();
        let moved = cursor.shrink(&env, 2 * MB).unwrap();

        assert_eq!(moved.new_break, base + 3 * MB);
        assert_eq!(table.heap().regions()[0].used(), 3 * MB);
        assert_eq!(
            fallback.calls().last(),
            Some(&FallbackCall::ShrinkHeap {
                addr: base + 4 * MB,
                len: MB,
                reserved: true
            })
        );

        cursor.shrink(&env, 3 * MB).unwrap();
        assert_eq!(table.heap().regions()[0].used(), 0);
        assert!(platform.calls().contains(&SimCall::Discard {
            addr: base,
            len: 4 * MB
        }));

        assert_eq!(
            cursor.shrink(&env, 1),
            Err(RouteError::InvalidShrink {
                requested: 1,
                available: 0
            })
        );
    }

    #[test]
    fn failed_growth_leaves_the_break_alone() {
        let (platform, table, fallback) = setup(SimulatedFallback::with_capacity(MB));
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();

        cursor.grow(&env, 4 * MB).unwrap();
        assert_eq!(
            cursor.grow(&env, 3 * MB),
            Err(RouteError::OutOfMemory(Errno::ENOMEM))
        );
        assert_eq!(cursor.offset(), 4 * MB);
        assert_eq!(table.heap().regions()[0].used(), 4 * MB);
        assert_eq!(fallback.live_bytes(), 0);
    }

    #[test]
    fn failed_growth_rolls_back_earlier_pieces() {
        let (platform, table, fallback) = setup(SimulatedFallback::with_capacity(5 * MB));
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();
        let base = table.heap().base();

        cursor.grow(&env, 4 * MB).unwrap();
        // The gap fits, the ceded prefix of the second rule does not.
        assert_eq!(
            cursor.grow(&env, 6 * MB),
            Err(RouteError::OutOfMemory(Errno::ENOMEM))
        );

        assert_eq!(
            fallback.calls().last(),
            Some(&FallbackCall::ShrinkHeap {
                addr: base + 4 * MB,
                len: 4 * MB,
                reserved: true
            })
        );
        assert_eq!(fallback.live_bytes(), 0);
        assert_eq!(cursor.offset(), 4 * MB);
        assert_eq!(table.heap().regions()[1].floor(), 2 * MB);
    }

    #[test]
    fn move_to_goes_both_ways() {
        let (platform, table, fallback) = setup(SimulatedFallback::new());
        let env = env(&platform, &table, &fallback, HeapSpill::Fallback);
        let cursor = HeapCursor::new();

        cursor.move_to(&env, 2 * MB).unwrap();
        assert_eq!(cursor.offset(), 2 * MB);
        cursor.move_to(&env, MB).unwrap();
        assert_eq!(cursor.offset(), MB);
        assert_eq!(table.heap().regions()[0].used(), MB);
    }
}
