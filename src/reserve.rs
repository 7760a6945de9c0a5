//! Start-up reservation of one backing region per placement rule.
//!
//! Heap rules share a single contiguous arena so that logical heap offset `n`
//! is always `arena + n`. Only the spans covered by rules get real pages; the
//! gaps stay inaccessible placeholder space until the fallback grows into them:
//!
//! ```text
//!  arena                                                      arena + limit
//!  +--------------+------------------+-----------------------------+
//!  | brk rule 2MB |  placeholder     |        brk rule 1GB         |
//!  +--------------+------------------+-----------------------------+
//!
//!  anywhere        +-------------+        +---------------------+
//!                  | mmap rule   |  ...   |      mmap rule      |
//!                  +-------------+        +---------------------+
//! ```

use std::sync::Arc;

use log::{info, warn};

use crate::config::{AllocKind, ConfigModel, PageSize, PlacementRule};
use crate::error::{ReservationError, ReservationResult};
use crate::kernel::PlatformMemory;
use crate::region::{Backing, Region};
use crate::settings::UnavailablePolicy;
use crate::utils::{align_up, is_aligned};

/// Knobs of the reservation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveOptions {
    /// Back every region with default pages.
    pub dry_run: bool,
    pub on_unavailable: UnavailablePolicy,
    /// Live slices each anonymous region can track.
    pub extent_slots: usize,
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            on_unavailable: UnavailablePolicy::Abort,
            extent_slots: 4096,
        }
    }
}

/// The contiguous heap reservation and the rule regions carved out of it.
#[derive(Debug)]
pub struct HeapArena {
    base: usize,
    limit: usize,
    regions: Vec<Region>,
}

impl HeapArena {
    /// Address of logical heap offset 0.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Bytes of the arena, i.e. the largest `end_offset` of any heap rule.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Heap regions sorted by `start_offset`.
    #[inline]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Index of the first region whose range ends after `offset`.
    pub(crate) fn region_index_after(&self, offset: usize) -> usize {
        self.regions
            .partition_point(|r| r.rule().range.end <= offset)
    }
}

/// Every region of the process, partitioned by kind.
///
/// Read only after start-up; the regions' own state is the only thing that
/// changes. Dropping the table gives all the memory back to the OS.
pub struct RoutingTable {
    heap: HeapArena,
    anon: Vec<Region>,
    /// Indices into `anon` sorted by base address.
    anon_by_address: Vec<usize>,
    platform: Arc<dyn PlatformMemory>,
}

impl RoutingTable {
    pub fn heap(&self) -> &HeapArena {
        &self.heap
    }

    /// Anonymous regions sorted by `start_offset`.
    pub fn anon_regions(&self) -> &[Region] {
        &self.anon
    }

    pub fn platform(&self) -> &Arc<dyn PlatformMemory> {
        &self.platform
    }

    /// The anonymous region containing `addr`.
    pub fn anon_region_at(&self, addr: usize) -> Option<&Region> {
        let idx = self
            .anon_by_address
            .partition_point(|&i| self.anon[i].base_address() <= addr);
        let region = &self.anon[*self.anon_by_address.get(idx.checked_sub(1)?)?];
        region.contains(addr).then_some(region)
    }

    /// First anonymous region starting above `addr`.
    pub fn anon_region_after(&self, addr: usize) -> Option<&Region> {
        let idx = self
            .anon_by_address
            .partition_point(|&i| self.anon[i].base_address() <= addr);
        self.anon_by_address.get(idx).map(|&i| &self.anon[i])
    }

    /// The region of either kind containing `addr`.
    pub fn region_at(&self, addr: usize) -> Option<&Region> {
        if self.in_heap(addr) {
            let regions = &self.heap.regions;
            let idx = regions.partition_point(|r| r.end_address() <= addr);
            return regions.get(idx).filter(|r| r.contains(addr));
        }
        self.anon_region_at(addr)
    }

    /// Whether `addr` is inside the heap arena.
    pub fn in_heap(&self, addr: usize) -> bool {
        addr >= self.heap.base && addr - self.heap.base < self.heap.limit
    }

    /// All regions, heap first.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.heap.regions.iter().chain(self.anon.iter())
    }
}

impl Drop for RoutingTable {
    fn drop(&mut self) {
        for region in &self.anon {
            if let Some(Backing { addr, len }) = region.backing() {
                if let Err(e) = self.platform.release(addr, len) {
                    warn!("cannot release region {:#x}+{:#x}: {}", addr, len, e);
                }
            }
        }
        if self.heap.limit > 0 {
            if let Err(e) = self.platform.release(self.heap.base, self.heap.limit) {
                warn!("cannot release heap arena {:#x}: {}", self.heap.base, e);
            }
        }
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("heap", &self.heap)
            .field("anon", &self.anon)
            .finish()
    }
}

/// Reserves a region for every rule of `model`.
///
/// Either every rule gets its region or nothing stays reserved.
pub fn reserve(
    model: &ConfigModel,
    platform: Arc<dyn PlatformMemory>,
    options: &ReserveOptions,
) -> ReservationResult<RoutingTable> {
    for rule in model.rules() {
        check_alignment(rule)?;
    }

    let heap = reserve_heap(
        &model.rules_of(AllocKind::HeapGrowth),
        platform.as_ref(),
        options,
    )?;

    // Partially built tables clean up after themselves on drop.
    let mut table = RoutingTable {
        heap,
        anon: Vec::new(),
        anon_by_address: Vec::new(),
        platform: Arc::clone(&platform),
    };

    for rule in model.rules_of(AllocKind::AnonymousMapping) {
        let (addr, page_size) = map_rule(rule, None, platform.as_ref(), options)?;
        let backing = Backing {
            addr,
            len: rule.len(),
        };

        info!(
            "mmap rule (line {}) reserved at {:#x}+{:#x} with {} pages",
            rule.line, addr, backing.len, page_size
        );
        table.anon.push(Region::anonymous(
            rule.clone(),
            backing,
            page_size,
            options.extent_slots,
        ));
    }

    let mut by_address: Vec<usize> = (0..table.anon.len()).collect();
    by_address.sort_by_key(|&i| table.anon[i].base_address());
    table.anon_by_address = by_address;

    Ok(table)
}

fn check_alignment(rule: &PlacementRule) -> ReservationResult<()> {
    let page = rule.page_size.bytes();
    if rule.len() < page || !is_aligned(rule.range.start, page) || !is_aligned(rule.len(), page) {
        return Err(ReservationError::MisalignedRange {
            line: rule.line,
            page_size: rule.page_size,
            start: rule.range.start,
            end: rule.range.end,
        });
    }
    Ok(())
}

fn reserve_heap(
    rules: &[&PlacementRule],
    platform: &dyn PlatformMemory,
    options: &ReserveOptions,
) -> ReservationResult<HeapArena> {
    let limit = rules.iter().map(|r| r.range.end).max().unwrap_or(0);
    let align = rules
        .iter()
        .map(|r| r.page_size.bytes())
        .max()
        .unwrap_or(PageSize::Base4K.bytes());

    // Prefer to sit right above the program's own break, like a real heap.
    let hint = align_up(platform.program_break(), align);

    // Without heap rules the whole heap is fallback territory starting there.
    if rules.is_empty() {
        return Ok(HeapArena {
            base: hint,
            limit: 0,
            regions: Vec::new(),
        });
    }

    let base = platform
        .reserve_placeholder(Some(hint), limit, align)
        .map_err(|source| ReservationError::AddressSpaceExhausted {
            length: limit,
            source,
        })?;

    let mut arena = HeapArena {
        base,
        limit,
        regions: Vec::with_capacity(rules.len()),
    };

    for rule in rules {
        let addr = base + rule.range.start;
        let mapped = map_rule(rule, Some(addr), platform, options);
        let page_size = match mapped {
            Ok((_, page_size)) => page_size,
            Err(e) => {
                if let Err(release) = platform.release(base, limit) {
                    warn!("cannot release heap arena {:#x}: {}", base, release);
                }
                return Err(e);
            }
        };

        info!(
            "brk rule (line {}) reserved at {:#x}+{:#x} with {} pages",
            rule.line,
            addr,
            rule.len(),
            page_size
        );
        arena
            .regions
            .push(Region::heap((*rule).clone(), addr, page_size));
    }

    info!("heap arena at {:#x}, {} bytes", base, limit);
    Ok(arena)
}

/// Maps the pages of one rule, honouring dry run and the unavailability
/// policy. Returns the address and the page size actually used.
fn map_rule(
    rule: &PlacementRule,
    addr: Option<usize>,
    platform: &dyn PlatformMemory,
    options: &ReserveOptions,
) -> ReservationResult<(usize, PageSize)> {
    let wanted = if options.dry_run {
        PageSize::Base4K
    } else {
        rule.page_size
    };

    match platform.map_pages(addr, rule.len(), wanted) {
        Ok(mapped) => Ok((mapped, wanted)),
        Err(source) if !wanted.is_huge() => Err(ReservationError::AddressSpaceExhausted {
            length: rule.len(),
            source,
        }),
        Err(source) => match options.on_unavailable {
            UnavailablePolicy::Abort => Err(ReservationError::PageSizeUnavailable {
                line: rule.line,
                page_size: wanted,
                length: rule.len(),
                free_pages: platform.free_huge_pages(wanted),
                source,
            }),
            UnavailablePolicy::Degrade => {
                warn!(
                    "rule on line {}: {} pages unavailable ({}), degrading to {}",
                    rule.line,
                    wanted,
                    source,
                    PageSize::Base4K
                );
                platform
                    .map_pages(addr, rule.len(), PageSize::Base4K)
                    .map(|mapped| (mapped, PageSize::Base4K))
                    .map_err(|source| ReservationError::AddressSpaceExhausted {
                        length: rule.len(),
                        source,
                    })
            }
        },
    }
}
