//! Steady state routing of intercepted calls.
//!
//! The router owns no memory. It decides, for every heap move and every
//! anonymous mapping, whether a region of the [`RoutingTable`] serves it or
//! the [`FallbackAllocator`] does, and keeps the regions' books.
//!
//! A miss is never an error: requests no rule applies to go to the fallback
//! exactly as the program issued them and show up as a
//! [`PolicyEvent::Fallback`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use nix::errno::Errno;

use crate::config::{AllocKind, PageSize};
use crate::error::{RouteError, RouteResult};
use crate::fallback::FallbackAllocator;
use crate::heap::{HeapBackends, HeapCursor, HeapMove};
use crate::region::Region;
use crate::request::{AllocationRequest, MapFlags, RemapFlags};
use crate::reserve::RoutingTable;
use crate::settings::HeapSpill;
use crate::utils::{align_up, is_aligned};

const BASE_PAGE: usize = PageSize::Base4K.bytes();

/// What region pages are mapped with.
const DEFAULT_PROT: i32 = libc::PROT_READ | libc::PROT_WRITE;

/// Why a request went to the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// No rule of the request's kind had room for it.
    NoMatchingRule,
    /// Shared, file backed, stack or explicit HugeTLB mappings.
    IncompatibleFlags,
    /// A fixed address outside every region.
    FixedOutsideRegions,
    ZeroSize,
    /// An address or heap offset no rule covers.
    OutsideRules,
}

/// Something worth knowing about a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    RegionHit {
        kind: AllocKind,
        addr: usize,
        len: usize,
        page_size: PageSize,
    },
    Fallback {
        kind: AllocKind,
        reason: FallbackReason,
        len: usize,
    },
    /// A heap move served partly by a region and partly by someone else.
    HeapSplit {
        old_break: usize,
        new_break: usize,
        region_bytes: usize,
        fallback_bytes: usize,
    },
    Released {
        addr: usize,
        len: usize,
    },
}

/// Snapshot of the router's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub region_hits: u64,
    pub heap_splits: u64,
    pub releases: u64,
    pub no_matching_rule: u64,
    pub incompatible_flags: u64,
    pub fixed_outside_regions: u64,
    pub zero_size: u64,
    pub outside_rules: u64,
}

impl RouterStats {
    /// Requests delegated to the fallback, for any reason.
    pub fn fallbacks(&self) -> u64 {
        self.no_matching_rule
            + self.incompatible_flags
            + self.fixed_outside_regions
            + self.zero_size
            + self.outside_rules
    }
}

#[derive(Default)]
struct Counters {
    region_hits: AtomicU64,
    heap_splits: AtomicU64,
    releases: AtomicU64,
    fallbacks: [AtomicU64; 5],
}

impl FallbackReason {
    fn index(self) -> usize {
        match self {
            FallbackReason::NoMatchingRule => 0,
            FallbackReason::IncompatibleFlags => 1,
            FallbackReason::FixedOutsideRegions => 2,
            FallbackReason::ZeroSize => 3,
            FallbackReason::OutsideRules => 4,
        }
    }
}

pub struct Router {
    table: Arc<RoutingTable>,
    fallback: Arc<dyn FallbackAllocator>,
    spill: HeapSpill,
    cursor: HeapCursor,
    counters: Counters,
}

fn os_errno(e: io::Error) -> RouteError {
    RouteError::Os(e.raw_os_error().map_or(Errno::EIO, Errno::from_raw))
}

impl Router {
    pub fn new(
        table: Arc<RoutingTable>,
        fallback: Arc<dyn FallbackAllocator>,
        spill: HeapSpill,
    ) -> Self {
        Self {
            table,
            fallback,
            spill,
            cursor: HeapCursor::new(),
            counters: Counters::default(),
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn spill(&self) -> HeapSpill {
        self.spill
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        let fallbacks = |reason: FallbackReason| c.fallbacks[reason.index()].load(Ordering::Relaxed);
        RouterStats {
            region_hits: c.region_hits.load(Ordering::Relaxed),
            heap_splits: c.heap_splits.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            no_matching_rule: fallbacks(FallbackReason::NoMatchingRule),
            incompatible_flags: fallbacks(FallbackReason::IncompatibleFlags),
            fixed_outside_regions: fallbacks(FallbackReason::FixedOutsideRegions),
            zero_size: fallbacks(FallbackReason::ZeroSize),
            outside_rules: fallbacks(FallbackReason::OutsideRules),
        }
    }

    fn record(&self, event: PolicyEvent) {
        let c = &self.counters;
        match event {
            PolicyEvent::RegionHit { .. } => c.region_hits.fetch_add(1, Ordering::Relaxed),
            PolicyEvent::Fallback { reason, .. } => {
                c.fallbacks[reason.index()].fetch_add(1, Ordering::Relaxed)
            }
            PolicyEvent::HeapSplit { .. } => c.heap_splits.fetch_add(1, Ordering::Relaxed),
            PolicyEvent::Released { .. } => c.releases.fetch_add(1, Ordering::Relaxed),
        };
        debug!("{:?}", event);
    }

    fn heap_backends(&self) -> HeapBackends<'_> {
        HeapBackends {
            arena: self.table.heap(),
            platform: self.table.platform().as_ref(),
            fallback: self.fallback.as_ref(),
            spill: self.spill,
        }
    }

    fn record_heap_move(&self, moved: &HeapMove) {
        let event = if moved.split {
            PolicyEvent::HeapSplit {
                old_break: moved.old_break,
                new_break: moved.new_break,
                region_bytes: moved.region_bytes,
                fallback_bytes: moved.fallback_bytes,
            }
        } else if moved.region_bytes > 0 {
            let page_size = self
                .table
                .region_at(moved.old_break)
                .map_or(PageSize::Base4K, Region::page_size);
            PolicyEvent::RegionHit {
                kind: AllocKind::HeapGrowth,
                addr: moved.old_break,
                len: moved.region_bytes,
                page_size,
            }
        } else {
            PolicyEvent::Fallback {
                kind: AllocKind::HeapGrowth,
                reason: FallbackReason::OutsideRules,
                len: moved.fallback_bytes,
            }
        };
        self.record(event);
    }

    /// Current program break.
    pub fn current_break(&self) -> usize {
        self.table.heap().base() + self.cursor.offset()
    }

    /// `sbrk` semantics: moves the break by `delta` and returns the previous
    /// break.
    pub fn heap_growth(&self, delta: isize) -> RouteResult<usize> {
        let env = self.heap_backends();
        let moved = match delta {
            0 => return Ok(self.current_break()),
            d if d > 0 => self.cursor.grow(&env, d as usize)?,
            d => self.cursor.shrink(&env, d.unsigned_abs())?,
        };

        if delta > 0 {
            self.record_heap_move(&moved);
        } else {
            debug!("heap shrunk to {:#x}", moved.new_break);
        }
        Ok(moved.old_break)
    }

    /// `brk` semantics: moves the break to `addr` and returns the new break.
    pub fn set_break(&self, addr: usize) -> RouteResult<usize> {
        let base = self.table.heap().base();
        let Some(offset) = addr.checked_sub(base) else {
            let available = self.cursor.offset();
            return Err(RouteError::InvalidShrink {
                requested: available + (base - addr),
                available,
            });
        };

        let env = self.heap_backends();
        let moved = self.cursor.move_to(&env, offset)?;
        if moved.new_break > moved.old_break {
            self.record_heap_move(&moved);
        }
        Ok(moved.new_break)
    }

    /// Serves an `mmap` request, from a region when a rule applies.
    pub fn map(&self, request: &AllocationRequest) -> RouteResult<usize> {
        let kind = AllocKind::AnonymousMapping;

        if request.size == 0 {
            return self.delegate_map(request, FallbackReason::ZeroSize);
        }
        if request.flags.intersects(MapFlags::INCOMPATIBLE) {
            return self.delegate_map(request, FallbackReason::IncompatibleFlags);
        }

        if request.flags.is_fixed() {
            let addr = request.hint_address.unwrap_or(0);
            return match self.table.anon_region_at(addr) {
                Some(region) => self.map_fixed(region, addr, request),
                None => self.delegate_map(request, FallbackReason::FixedOutsideRegions),
            };
        }

        let len = align_up(request.size, BASE_PAGE);
        for region in self.table.anon_regions() {
            if let Some(addr) = region.try_place(len)? {
                if let Err(e) = self.apply_protection(region, addr, len, request.prot) {
                    region.release(addr, len)?;
                    return Err(e);
                }
                self.record(PolicyEvent::RegionHit {
                    kind,
                    addr,
                    len,
                    page_size: region.page_size(),
                });
                return Ok(addr);
            }
        }

        self.delegate_map(request, FallbackReason::NoMatchingRule)
    }

    fn map_fixed(
        &self,
        region: &Region,
        addr: usize,
        request: &AllocationRequest,
    ) -> RouteResult<usize> {
        let len = align_up(request.size, region.page_size().bytes());
        let replace = !request.flags.contains(MapFlags::FIXED_NOREPLACE);

        region.claim(addr, len, replace)?;
        if replace {
            self.table
                .platform()
                .discard(addr, len)
                .map_err(os_errno)?;
        }
        if let Err(e) = self.apply_protection(region, addr, len, request.prot) {
            region.release(addr, len)?;
            return Err(e);
        }

        self.record(PolicyEvent::RegionHit {
            kind: AllocKind::AnonymousMapping,
            addr,
            len,
            page_size: region.page_size(),
        });
        Ok(addr)
    }

    /// Gives `[addr, addr + len)` the protection `prot`. Regions whose pages
    /// never left the default need no call.
    fn apply_protection(
        &self,
        region: &Region,
        addr: usize,
        len: usize,
        prot: i32,
    ) -> RouteResult<()> {
        {
            let mut state = region.lock_state();
            if prot == DEFAULT_PROT && !state.protected {
                return Ok(());
            }
            state.protected |= prot != DEFAULT_PROT;
        }
        self.table
            .platform()
            .protect(addr, len, prot)
            .map_err(os_errno)
    }

    fn delegate_map(
        &self,
        request: &AllocationRequest,
        reason: FallbackReason,
    ) -> RouteResult<usize> {
        self.record(PolicyEvent::Fallback {
            kind: request.kind,
            reason,
            len: request.size,
        });
        self.fallback.alloc(request).map_err(RouteError::Fallback)
    }

    /// `munmap` semantics. The range may cover regions and foreign memory
    /// alike; each piece goes to its owner.
    pub fn free(&self, addr: usize, len: usize) -> RouteResult<()> {
        if len == 0 || !is_aligned(addr, BASE_PAGE) {
            return Err(RouteError::InvalidArgument);
        }

        let end = addr
            .checked_add(align_up(len, BASE_PAGE))
            .ok_or(RouteError::InvalidArgument)?;
        let mut cur = addr;

        while cur < end {
            if let Some(region) = self.table.anon_region_at(cur) {
                let stop = end.min(region.end_address());
                self.release_in_region(region, cur, stop - cur)?;
                cur = stop;
            } else {
                let stop = self
                    .table
                    .anon_region_after(cur)
                    .map_or(end, |r| end.min(r.base_address()));
                self.record(PolicyEvent::Fallback {
                    kind: AllocKind::AnonymousMapping,
                    reason: FallbackReason::OutsideRules,
                    len: stop - cur,
                });
                self.fallback
                    .free(cur, stop - cur)
                    .map_err(RouteError::Fallback)?;
                cur = stop;
            }
        }

        Ok(())
    }

    fn release_in_region(&self, region: &Region, addr: usize, len: usize) -> RouteResult<()> {
        let page = region.page_size().bytes();
        if !is_aligned(addr, page) {
            return Err(RouteError::InvalidArgument);
        }
        let len = align_up(len, page).min(region.end_address() - addr);

        let freed = region.release(addr, len)?;
        if freed > 0 {
            // Reused capacity has to read back as zeros, with default protection.
            self.table
                .platform()
                .discard(addr, len)
                .map_err(os_errno)?;
            self.apply_protection(region, addr, len, DEFAULT_PROT)?;
            self.record(PolicyEvent::Released { addr, len: freed });
        }
        Ok(())
    }

    /// `mremap` semantics.
    pub fn remap(
        &self,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: RemapFlags,
        new_addr: usize,
    ) -> RouteResult<usize> {
        let Some(region) = self.table.anon_region_at(old_addr) else {
            return self
                .fallback
                .realloc(old_addr, old_len, new_len, flags, new_addr)
                .map_err(RouteError::Fallback);
        };

        let page = region.page_size().bytes();
        let moves = flags.intersects(RemapFlags::FIXED | RemapFlags::DONTUNMAP);
        if new_len == 0
            || !is_aligned(old_addr, page)
            || (moves && !flags.contains(RemapFlags::MAYMOVE))
        {
            return Err(RouteError::InvalidArgument);
        }

        let old_len = align_up(old_len, page);
        let new_len = align_up(new_len, page);

        // The kernel refuses to move a mapping onto itself.
        if flags.contains(RemapFlags::FIXED)
            && new_addr < old_addr.saturating_add(old_len)
            && old_addr < new_addr.saturating_add(new_len)
        {
            return Err(RouteError::InvalidArgument);
        }

        if !moves {
            if new_len <= old_len {
                if new_len < old_len {
                    self.release_in_region(region, old_addr + new_len, old_len - new_len)?;
                }
                return Ok(old_addr);
            }
            if region.extend(old_addr, old_len, new_len - old_len)? {
                self.record(PolicyEvent::RegionHit {
                    kind: AllocKind::AnonymousMapping,
                    addr: old_addr + old_len,
                    len: new_len - old_len,
                    page_size: region.page_size(),
                });
                return Ok(old_addr);
            }
            if !flags.contains(RemapFlags::MAYMOVE) {
                return Err(RouteError::OutOfMemory(Errno::ENOMEM));
            }
        }

        let request = if flags.contains(RemapFlags::FIXED) {
            AllocationRequest::anonymous(new_len).with_fixed_replace(new_addr)
        } else {
            AllocationRequest::anonymous(new_len)
        };
        let target = self.map(&request)?;

        // Both ranges are live mappings owned by the program.
        unsafe {
            self.table
                .platform()
                .copy(old_addr, target, old_len.min(new_len));
        }

        if flags.contains(RemapFlags::DONTUNMAP) {
            self.table
                .platform()
                .discard(old_addr, old_len)
                .map_err(os_errno)?;
        } else {
            self.free(old_addr, old_len)?;
        }

        Ok(target)
    }

    /// `mprotect` semantics. Ranges not aligned to their region's page size
    /// are acknowledged and left alone.
    pub fn protect(&self, addr: usize, len: usize, prot: i32) -> RouteResult<()> {
        match self.table.region_at(addr) {
            None => self
                .fallback
                .protect(addr, len, prot)
                .map_err(RouteError::Fallback),
            Some(region) if Self::page_exact(region, addr, len) => {
                region.lock_state().protected |= prot != DEFAULT_PROT;
                self.table
                    .platform()
                    .protect(addr, len, prot)
                    .map_err(os_errno)
            }
            Some(_) => {
                debug!("ignoring mprotect of {:#x}+{:#x}", addr, len);
                Ok(())
            }
        }
    }

    /// `madvise` semantics, same ownership rules as [`Router::protect`].
    pub fn advise(&self, addr: usize, len: usize, advice: i32) -> RouteResult<()> {
        match self.table.region_at(addr) {
            None => self
                .fallback
                .advise(addr, len, advice)
                .map_err(RouteError::Fallback),
            Some(region) if Self::page_exact(region, addr, len) => self
                .table
                .platform()
                .advise(addr, len, advice)
                .map_err(os_errno),
            Some(_) => {
                debug!("ignoring madvise({}) of {:#x}+{:#x}", advice, addr, len);
                Ok(())
            }
        }
    }

    fn page_exact(region: &Region, addr: usize, len: usize) -> bool {
        let page = region.page_size().bytes();
        region.encloses(addr, len) && is_aligned(addr, page) && is_aligned(len, page)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("table", &self.table)
            .field("spill", &self.spill)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse;
    use crate::reserve::{ReserveOptions, reserve};
    use crate::settings::UnavailablePolicy;
    use crate::sim::{FallbackCall, SimCall, SimulatedFallback, SimulatedMemory};

    const MB: usize = 1 << 20;

    struct Fixture {
        platform: Arc<SimulatedMemory>,
        fallback: Arc<SimulatedFallback>,
        router: Router,
    }

    fn pool() -> SimulatedMemory {
        SimulatedMemory::new()
            .with_huge_pages(PageSize::Huge2M, 64)
            .with_huge_pages(PageSize::Huge1G, 2)
    }

    fn fixture(rules: &str) -> Fixture {
        fixture_with(pool(), ReserveOptions::default(), rules)
    }

    fn fixture_with(platform: SimulatedMemory, options: ReserveOptions, rules: &str) -> Fixture {
        let platform = Arc::new(platform);
        let fallback = Arc::new(SimulatedFallback::new());
        let model = parse(&format!("type,page_size,start_offset,end_offset\n{rules}")).unwrap();
        let table = reserve(&model, platform.clone(), &options).unwrap();
        let router = Router::new(Arc::new(table), fallback.clone(), HeapSpill::Fallback);

        Fixture {
            platform,
            fallback,
            router,
        }
    }

    #[test]
    fn first_rule_with_room_wins() {
        let f = fixture("mmap,2MB,0,4MB\nmmap,4KB,4MB,8MB\n");
        let [huge, small] = f.router.table().anon_regions() else {
            panic!("expected two regions");
        };

        let a = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();
        let b = f.router.map(&AllocationRequest::anonymous(8192)).unwrap();
        let c = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();
        let d = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();

        assert!(huge.contains(a));
        assert!(small.contains(b));
        assert!(huge.contains(c));
        assert!(small.contains(d));
        assert_eq!(f.router.stats().region_hits, 4);
    }

    #[test]
    fn misses_go_to_the_fallback_untouched() {
        let f = fixture("mmap,2MB,0,2MB\n");

        let shared = AllocationRequest::from_mmap(
            0,
            2 * MB,
            libc::PROT_READ,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        f.router.map(&shared).unwrap();
        f.router.map(&AllocationRequest::anonymous(4 * MB)).unwrap();
        f.router.map(&AllocationRequest::anonymous(0)).unwrap();

        let stats = f.router.stats();
        assert_eq!(stats.incompatible_flags, 1);
        assert_eq!(stats.no_matching_rule, 1);
        assert_eq!(stats.zero_size, 1);
        assert_eq!(stats.region_hits, 0);
        assert_eq!(f.fallback.calls().len(), 3);
    }

    #[test]
    fn fixed_noreplace_inside_a_region() {
        let f = fixture("mmap,2MB,0,8MB\n");
        let base = f.router.table().anon_regions()[0].base_address();

        let req = AllocationRequest::anonymous(2 * MB).with_fixed_address(base + 2 * MB);
        assert_eq!(f.router.map(&req), Ok(base + 2 * MB));
        assert_eq!(
            f.router.map(&req),
            Err(RouteError::AddressInUse {
                addr: base + 2 * MB,
                len: 2 * MB
            })
        );
        assert_eq!(f.router.map(&req).unwrap_err().errno(), Errno::EEXIST);

        // First fit skips the claimed slice.
        let next = f.router.map(&AllocationRequest::anonymous(4 * MB)).unwrap();
        assert_eq!(next, base + 4 * MB);
    }

    #[test]
    fn fixed_outside_regions_is_delegated() {
        let f = fixture("mmap,2MB,0,2MB\n");
        let req = AllocationRequest::anonymous(MB).with_fixed_address(0x7000_0000);

        assert_eq!(f.router.map(&req), Ok(0x7000_0000));
        assert_eq!(f.router.stats().fixed_outside_regions, 1);
    }

    #[test]
    fn free_discards_and_makes_room() {
        let f = fixture("mmap,2MB,0,4MB\n");
        let a = f.router.map(&AllocationRequest::anonymous(4 * MB)).unwrap();

        f.router.free(a, 2 * MB).unwrap();
        assert!(f.platform.calls().contains(&SimCall::Discard { addr: a, len: 2 * MB }));

        let b = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();
        assert_eq!(b, a);
        assert_eq!(f.router.stats().releases, 1);
    }

    #[test]
    fn free_outside_regions_goes_to_the_fallback() {
        let f = fixture("mmap,2MB,0,2MB\n");
        f.router.free(0x7000_0000, 4096).unwrap();

        assert_eq!(
            f.fallback.calls(),
            vec![FallbackCall::Free {
                addr: 0x7000_0000,
                len: 4096
            }]
        );
        assert_eq!(f.router.free(0x7000_0001, 4096), Err(RouteError::InvalidArgument));
    }

    #[test]
    fn free_of_a_partial_huge_page_is_rejected() {
        let f = fixture("mmap,2MB,0,4MB\n");
        let a = f.router.map(&AllocationRequest::anonymous(4 * MB)).unwrap();

        assert_eq!(f.router.free(a + MB, MB), Err(RouteError::InvalidArgument));
    }

    #[test]
    fn remap_in_place_and_by_moving() {
        let f = fixture("mmap,2MB,0,8MB\n");
        let a = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();

        // Room behind the slice: grow in place.
        assert_eq!(f.router.remap(a, 2 * MB, 4 * MB, RemapFlags::empty(), 0), Ok(a));
        // Shrink in place.
        assert_eq!(f.router.remap(a, 4 * MB, 2 * MB, RemapFlags::empty(), 0), Ok(a));

        let _blocker = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();
        assert_eq!(
            f.router.remap(a, 2 * MB, 4 * MB, RemapFlags::empty(), 0),
            Err(RouteError::OutOfMemory(Errno::ENOMEM))
        );

        let moved = f.router.remap(a, 2 * MB, 4 * MB, RemapFlags::MAYMOVE, 0).unwrap();
        assert_ne!(moved, a);
        assert!(f.platform.calls().contains(&SimCall::Copy {
            src: a,
            dst: moved,
            len: 2 * MB
        }));
        assert_eq!(f.router.table().anon_regions()[0].used(), 6 * MB);
    }

    #[test]
    fn remap_of_foreign_memory_uses_realloc() {
        let f = fixture("mmap,2MB,0,2MB\n");
        f.router
            .remap(0x7000_0000, 4096, 8192, RemapFlags::MAYMOVE, 0)
            .unwrap();

        assert!(matches!(
            f.fallback.calls().as_slice(),
            [FallbackCall::Realloc { old: 0x7000_0000, len: 8192, .. }]
        ));
    }

    #[test]
    fn protect_is_forwarded_only_when_page_exact() {
        let f = fixture("mmap,2MB,0,4MB\n");
        let a = f.router.map(&AllocationRequest::anonymous(4 * MB)).unwrap();

        f.router.protect(a, 2 * MB, libc::PROT_READ).unwrap();
        f.router.protect(a, 4096, libc::PROT_READ).unwrap();
        f.router.advise(a + 2 * MB, 2 * MB, libc::MADV_DONTNEED).unwrap();

        let calls = f.platform.calls();
        assert!(calls.contains(&SimCall::Protect {
            addr: a,
            len: 2 * MB,
            prot: libc::PROT_READ
        }));
        assert!(!calls.contains(&SimCall::Protect {
            addr: a,
            len: 4096,
            prot: libc::PROT_READ
        }));
        assert!(calls.contains(&SimCall::Advise {
            addr: a + 2 * MB,
            len: 2 * MB,
            advice: libc::MADV_DONTNEED
        }));
    }

    #[test]
    fn fixed_replaces_live_slices() {
        let f = fixture("mmap,2MB,0,8MB\n");
        let a = f.router.map(&AllocationRequest::anonymous(4 * MB)).unwrap();

        let req = AllocationRequest::anonymous(2 * MB).with_fixed_replace(a + 2 * MB);
        assert_eq!(f.router.map(&req), Ok(a + 2 * MB));
        assert!(f.platform.calls().contains(&SimCall::Discard {
            addr: a + 2 * MB,
            len: 2 * MB
        }));

        let region = &f.router.table().anon_regions()[0];
        assert_eq!(region.used(), 4 * MB);
        assert_eq!(region.live_slices(), vec![a..a + 4 * MB]);
    }

    #[test]
    fn full_extent_table_falls_back() {
        let options = ReserveOptions {
            extent_slots: 1,
            ..Default::default()
        };
        let f = fixture_with(pool(), options, "mmap,2MB,0,8MB\n");
        let base = f.router.table().anon_regions()[0].base_address();

        let pinned = AllocationRequest::anonymous(2 * MB).with_fixed_address(base + 4 * MB);
        f.router.map(&pinned).unwrap();

        // The hole at the start would need a second slot.
        let addr = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();
        assert!(f.router.table().anon_region_at(addr).is_none());
        assert_eq!(f.router.stats().no_matching_rule, 1);
        assert_eq!(f.fallback.calls().len(), 1);
    }

    #[test]
    fn degraded_region_serves_default_pages() {
        let options = ReserveOptions {
            on_unavailable: UnavailablePolicy::Degrade,
            ..Default::default()
        };
        let f = fixture_with(SimulatedMemory::new(), options, "mmap,2MB,0,4MB\n");
        let region = &f.router.table().anon_regions()[0];
        assert_eq!(region.page_size(), PageSize::Base4K);

        let addr = f.router.map(&AllocationRequest::anonymous(8192)).unwrap();
        assert_eq!(addr, region.base_address());
        f.router.free(addr, 4096).unwrap();

        assert_eq!(region.used(), 4096);
        assert_eq!(f.router.stats().region_hits, 1);
        assert!(f.fallback.calls().is_empty());
    }

    #[test]
    fn requested_protection_is_applied() {
        let f = fixture("mmap,2MB,0,8MB\n");
        let guard = AllocationRequest::from_mmap(
            0,
            2 * MB,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );

        let a = f.router.map(&guard).unwrap();
        assert!(f.router.table().anon_region_at(a).is_some());
        assert!(f.platform.calls().contains(&SimCall::Protect {
            addr: a,
            len: 2 * MB,
            prot: libc::PROT_NONE
        }));

        // Freed pages come back read/write for the next owner.
        f.router.free(a, 2 * MB).unwrap();
        assert!(f.platform.calls().contains(&SimCall::Protect {
            addr: a,
            len: 2 * MB,
            prot: libc::PROT_READ | libc::PROT_WRITE
        }));
    }

    #[test]
    fn failed_protection_gives_the_slice_back() {
        let f = fixture_with(
            pool().refusing_protect(),
            ReserveOptions::default(),
            "mmap,2MB,0,4MB\n",
        );
        let read_only = AllocationRequest::from_mmap(
            0,
            2 * MB,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );

        assert_eq!(f.router.map(&read_only), Err(RouteError::Os(Errno::EACCES)));
        let region = &f.router.table().anon_regions()[0];
        assert_eq!(region.used(), 0);
        assert!(region.live_slices().is_empty());
        assert_eq!(f.router.stats().region_hits, 0);
    }

    #[test]
    fn remap_fixed_replaces_the_target() {
        let f = fixture("mmap,2MB,0,8MB\n");
        let a = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();
        let b = f.router.map(&AllocationRequest::anonymous(2 * MB)).unwrap();

        let flags = RemapFlags::MAYMOVE | RemapFlags::FIXED;
        assert_eq!(f.router.remap(a, 2 * MB, 2 * MB, flags, b), Ok(b));
        assert!(f.platform.calls().contains(&SimCall::Copy {
            src: a,
            dst: b,
            len: 2 * MB
        }));

        let region = &f.router.table().anon_regions()[0];
        assert_eq!(region.used(), 2 * MB);
        assert_eq!(region.live_slices(), vec![b..b + 2 * MB]);

        // Source and target may not overlap.
        assert_eq!(
            f.router.remap(b, 2 * MB, 4 * MB, flags, b),
            Err(RouteError::InvalidArgument)
        );
    }

    #[test]
    fn sbrk_and_brk_move_the_same_break() {
        let f = fixture("brk,2MB,0,4MB\n");
        let base = f.router.table().heap().base();

        assert_eq!(f.router.heap_growth(0), Ok(base));
        assert_eq!(f.router.heap_growth(4096), Ok(base));
        assert_eq!(f.router.set_break(base + MB), Ok(base + MB));
        assert_eq!(f.router.current_break(), base + MB);
        assert_eq!(f.router.heap_growth(-(MB as isize)), Ok(base + MB));
        assert_eq!(f.router.current_break(), base);

        assert!(matches!(
            f.router.set_break(base - 1),
            Err(RouteError::InvalidShrink { .. })
        ));
        assert_eq!(
            f.router.heap_growth(-1),
            Err(RouteError::InvalidShrink {
                requested: 1,
                available: 0
            })
        );
    }

    #[test]
    fn heap_split_is_counted() {
        let f = fixture("brk,2MB,0,2MB\n");

        f.router.heap_growth((MB + MB / 2) as isize).unwrap();
        f.router.heap_growth(MB as isize).unwrap();
        f.router.heap_growth(MB as isize).unwrap();

        let stats = f.router.stats();
        assert_eq!(stats.region_hits, 1);
        assert_eq!(stats.heap_splits, 1);
        assert_eq!(stats.outside_rules, 1);
    }
}
