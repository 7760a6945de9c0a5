use nix::errno::Errno;

use crate::request::{AllocationRequest, RemapFlags};

/// The general purpose allocator behind the shim.
///
/// Everything no placement rule applies to ends up here, exactly as the
/// program asked for it. The router treats it as opaque and thread safe.
pub trait FallbackAllocator: Send + Sync {
    /// Direct mapping primitive, `mmap(2)` with the request's raw arguments.
    fn alloc(&self, request: &AllocationRequest) -> Result<usize, Errno>;

    fn free(&self, addr: usize, len: usize) -> Result<(), Errno>;

    /// `mremap(2)` of a mapping the fallback owns.
    fn realloc(
        &self,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: RemapFlags,
        new_addr: usize,
    ) -> Result<usize, Errno>;

    fn protect(&self, addr: usize, len: usize, prot: i32) -> Result<(), Errno>;

    fn advise(&self, addr: usize, len: usize, advice: i32) -> Result<(), Errno>;

    /// Backs `[addr, addr + len)` of the heap with default pages.
    ///
    /// `reserved` tells whether the span lies inside the shim's heap arena, in
    /// which case whatever is mapped there belongs to the shim and can be
    /// replaced. Outside the arena nothing may be clobbered.
    fn grow_heap(&self, addr: usize, len: usize, reserved: bool) -> Result<(), Errno>;

    /// Gives back `[addr, addr + len)` of the heap after the break moved below
    /// it. Inside the arena the span goes back to being placeholder space.
    fn shrink_heap(&self, addr: usize, len: usize, reserved: bool) -> Result<(), Errno>;
}

/// Fallback that forwards to the kernel through raw syscalls, so it works
/// the same whether or not the preload hooks are installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFallback;

#[cfg(target_os = "linux")]
mod linux {
    use libc::c_int;
    use log::warn;
    use nix::errno::Errno;

    use super::{FallbackAllocator, SystemFallback};
    use crate::kernel::{sys_madvise, sys_mmap, sys_mprotect, sys_mremap, sys_munmap};
    use crate::request::{AllocationRequest, RemapFlags};

    const HEAP_PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
    const HEAP_FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    fn errno_of(e: std::io::Error) -> Errno {
        e.raw_os_error().map_or(Errno::ENOMEM, Errno::from_raw)
    }

    impl FallbackAllocator for SystemFallback {
        fn alloc(&self, request: &AllocationRequest) -> Result<usize, Errno> {
            unsafe {
                sys_mmap(
                    request.hint_address.unwrap_or(0),
                    request.size,
                    request.prot,
                    request.raw_flags,
                    request.fd,
                    request.offset,
                )
            }
            .map_err(errno_of)
        }

        fn free(&self, addr: usize, len: usize) -> Result<(), Errno> {
            unsafe { sys_munmap(addr, len) }.map_err(errno_of)
        }

        fn realloc(
            &self,
            old_addr: usize,
            old_len: usize,
            new_len: usize,
            flags: RemapFlags,
            new_addr: usize,
        ) -> Result<usize, Errno> {
            let mut raw = 0;
            if flags.contains(RemapFlags::MAYMOVE) {
                raw |= libc::MREMAP_MAYMOVE;
            }
            if flags.contains(RemapFlags::FIXED) {
                raw |= libc::MREMAP_FIXED;
            }
            if flags.contains(RemapFlags::DONTUNMAP) {
                raw |= libc::MREMAP_DONTUNMAP;
            }

            unsafe { sys_mremap(old_addr, old_len, new_len, raw, new_addr) }.map_err(errno_of)
        }

        fn protect(&self, addr: usize, len: usize, prot: i32) -> Result<(), Errno> {
            unsafe { sys_mprotect(addr, len, prot) }.map_err(errno_of)
        }

        fn advise(&self, addr: usize, len: usize, advice: i32) -> Result<(), Errno> {
            unsafe { sys_madvise(addr, len, advice) }.map_err(errno_of)
        }

        fn grow_heap(&self, addr: usize, len: usize, reserved: bool) -> Result<(), Errno> {
            let flags = if reserved {
                HEAP_FLAGS | libc::MAP_FIXED
            } else {
                HEAP_FLAGS | libc::MAP_FIXED_NOREPLACE
            };

            let mapped = unsafe { sys_mmap(addr, len, HEAP_PROT, flags, -1, 0) }.map_err(|e| {
                match errno_of(e) {
                    Errno::EEXIST => Errno::ENOMEM,
                    errno => errno,
                }
            })?;

            // Kernels older than 4.17 ignore MAP_FIXED_NOREPLACE and treat the
            // address as a hint.
            if mapped != addr {
                if let Err(e) = unsafe { sys_munmap(mapped, len) } {
                    warn!("cannot unmap misplaced heap pages {:#x}+{:#x}: {}", mapped, len, e);
                }
                return Err(Errno::ENOMEM);
            }

            Ok(())
        }

        fn shrink_heap(&self, addr: usize, len: usize, reserved: bool) -> Result<(), Errno> {
            if reserved {
                let flags = libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_FIXED;
                unsafe { sys_mmap(addr, len, libc::PROT_NONE, flags, -1, 0) }
                    .map(|_| ())
                    .map_err(errno_of)
            } else {
                unsafe { sys_munmap(addr, len) }.map_err(errno_of)
            }
        }
    }
}
