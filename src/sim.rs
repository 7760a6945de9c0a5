//! In-process simulated backends.
//!
//! [`SimulatedMemory`] and [`SimulatedFallback`] hand out made-up addresses
//! and keep a log of what was asked of them, so the reservation and routing
//! logic can be exercised without touching the address space. Nothing they
//! return may be dereferenced.

use std::collections::HashMap;
use std::io;
use nix::errno::Errno;
use spin::Mutex;

use crate::config::PageSize;
use crate::fallback::FallbackAllocator;
use crate::kernel::PlatformMemory;
use crate::request::{AllocationRequest, RemapFlags};
use crate::utils::align_up;

const SIM_MEMORY_BASE: usize = 0x1000_0000_0000;
const SIM_FALLBACK_BASE: usize = 0x3000_0000_0000;

/// One call recorded by a simulated backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Placeholder { addr: usize, len: usize },
    Map { addr: usize, len: usize, page_size: PageSize },
    Release { addr: usize, len: usize },
    Discard { addr: usize, len: usize },
    Protect { addr: usize, len: usize, prot: i32 },
    Advise { addr: usize, len: usize, advice: i32 },
    Copy { src: usize, dst: usize, len: usize },
}

#[derive(Debug, Default)]
struct MemoryState {
    next: usize,
    free_pages: HashMap<PageSize, usize>,
    calls: Vec<SimCall>,
    refuse_protect: bool,
}

/// A fake OS with a configurable HugeTLB pool.
#[derive(Debug)]
pub struct SimulatedMemory {
    state: Mutex<MemoryState>,
    program_break: usize,
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMemory {
    /// A backend with an empty HugeTLB pool. Default pages never run out.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next: SIM_MEMORY_BASE,
                ..Default::default()
            }),
            program_break: 0x5555_0000_0000,
        }
    }

    /// Adds `count` free pages of `page_size` to the pool.
    pub fn with_huge_pages(self, page_size: PageSize, count: usize) -> Self {
        *self
            .state
            .lock()
            .free_pages
            .entry(page_size)
            .or_default() += count;
        self
    }

    /// Makes every `protect` fail with `EACCES`.
    pub fn refusing_protect(self) -> Self {
        self.state.lock().refuse_protect = true;
        self
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn free_pages(&self, page_size: PageSize) -> usize {
        self.state
            .lock()
            .free_pages
            .get(&page_size)
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, call: SimCall) {
        self.state.lock().calls.push(call);
    }
}

impl PlatformMemory for SimulatedMemory {
    fn reserve_placeholder(
        &self,
        _hint: Option<usize>,
        len: usize,
        align: usize,
    ) -> io::Result<usize> {
        let mut state = self.state.lock();
        let addr = align_up(state.next, align);
        state.next = addr + len;
        state.calls.push(SimCall::Placeholder { addr, len });
        Ok(addr)
    }

    fn map_pages(&self, addr: Option<usize>, len: usize, page_size: PageSize) -> io::Result<usize> {
        let mut state = self.state.lock();

        if page_size.is_huge() {
            let pages = len / page_size.bytes();
            let free = state.free_pages.entry(page_size).or_default();
            if *free < pages {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            *free -= pages;
        }

        let addr = match addr {
            Some(addr) => addr,
            None => {
                let addr = align_up(state.next, page_size.bytes());
                state.next = addr + len;
                addr
            }
        };
        state.calls.push(SimCall::Map {
            addr,
            len,
            page_size,
        });
        Ok(addr)
    }

    fn release(&self, addr: usize, len: usize) -> io::Result<()> {
        self.record(SimCall::Release { addr, len });
        Ok(())
    }

    fn discard(&self, addr: usize, len: usize) -> io::Result<()> {
        self.record(SimCall::Discard { addr, len });
        Ok(())
    }

    fn protect(&self, addr: usize, len: usize, prot: i32) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.refuse_protect {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        state.calls.push(SimCall::Protect { addr, len, prot });
        Ok(())
    }

    fn advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()> {
        self.record(SimCall::Advise { addr, len, advice });
        Ok(())
    }

    unsafe fn copy(&self, src: usize, dst: usize, len: usize) {
        self.record(SimCall::Copy { src, dst, len });
    }

    fn program_break(&self) -> usize {
        self.program_break
    }

    fn free_huge_pages(&self, page_size: PageSize) -> Option<usize> {
        Some(self.free_pages(page_size))
    }
}

/// Something the simulated fallback was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackCall {
    Alloc { addr: usize, len: usize },
    Free { addr: usize, len: usize },
    Realloc { old: usize, new: usize, len: usize },
    GrowHeap { addr: usize, len: usize, reserved: bool },
    ShrinkHeap { addr: usize, len: usize, reserved: bool },
    Protect { addr: usize, len: usize },
    Advise { addr: usize, len: usize },
}

#[derive(Debug)]
struct FallbackState {
    next: usize,
    live: usize,
    capacity: usize,
    calls: Vec<FallbackCall>,
}

/// A fake general purpose allocator with an optional byte budget, after
/// which it reports `ENOMEM` like a real system running out of memory.
#[derive(Debug)]
pub struct SimulatedFallback {
    state: Mutex<FallbackState>,
}

impl Default for SimulatedFallback {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFallback {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FallbackState {
                next: SIM_FALLBACK_BASE,
                live: 0,
                capacity,
                calls: Vec::new(),
            }),
        }
    }

    pub fn calls(&self) -> Vec<FallbackCall> {
        self.state.lock().calls.clone()
    }

    /// Bytes currently handed out, mappings and heap alike.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live
    }

    fn take(state: &mut FallbackState, len: usize) -> Result<(), Errno> {
        if state.capacity - state.live < len {
            return Err(Errno::ENOMEM);
        }
        state.live += len;
        Ok(())
    }
}

impl FallbackAllocator for SimulatedFallback {
    fn alloc(&self, request: &AllocationRequest) -> Result<usize, Errno> {
        let mut state = self.state.lock();
        let len = align_up(request.size, PageSize::Base4K.bytes());
        Self::take(&mut state, len)?;

        let addr = match request.hint_address {
            Some(addr) if request.flags.is_fixed() => addr,
            _ => {
                let addr = state.next;
                state.next += len;
                addr
            }
        };
        state.calls.push(FallbackCall::Alloc { addr, len });
        Ok(addr)
    }

    fn free(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(len);
        state.calls.push(FallbackCall::Free { addr, len });
        Ok(())
    }

    fn realloc(
        &self,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: RemapFlags,
        new_addr: usize,
    ) -> Result<usize, Errno> {
        let mut state = self.state.lock();
        if new_len > old_len {
            Self::take(&mut state, new_len - old_len)?;
        } else {
            state.live = state.live.saturating_sub(old_len - new_len);
        }

        let addr = if flags.contains(RemapFlags::FIXED) {
            new_addr
        } else if new_len > old_len && flags.contains(RemapFlags::MAYMOVE) {
            let addr = state.next;
            state.next += new_len;
            addr
        } else {
            old_addr
        };
        state.calls.push(FallbackCall::Realloc {
            old: old_addr,
            new: addr,
            len: new_len,
        });
        Ok(addr)
    }

    fn protect(&self, addr: usize, len: usize, _prot: i32) -> Result<(), Errno> {
        self.state
            .lock()
            .calls
            .push(FallbackCall::Protect { addr, len });
        Ok(())
    }

    fn advise(&self, addr: usize, len: usize, _advice: i32) -> Result<(), Errno> {
        self.state
            .lock()
            .calls
            .push(FallbackCall::Advise { addr, len });
        Ok(())
    }

    fn grow_heap(&self, addr: usize, len: usize, reserved: bool) -> Result<(), Errno> {
        let mut state = self.state.lock();
        Self::take(&mut state, len)?;
        state.calls.push(FallbackCall::GrowHeap {
            addr,
            len,
            reserved,
        });
        Ok(())
    }

    fn shrink_heap(&self, addr: usize, len: usize, reserved: bool) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(len);
        state.calls.push(FallbackCall::ShrinkHeap {
            addr,
            len,
            reserved,
        });
        Ok(())
    }
}
