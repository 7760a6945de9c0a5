use std::io;

use crate::config::PageSize;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The router, our top level view of this, has nothing to do
/// with the concrete APIs offered by each kernel, and tests can swap in
/// `SimulatedMemory` (feature `sim`) to exercise routing without touching the
/// address space.
///
/// Every implementation used inside a preloaded process must reach the OS
/// without going through the exported `mmap`/`munmap` symbols, otherwise the
/// call would come straight back into the shim.
pub trait PlatformMemory: Send + Sync {
    /// Reserves `len` bytes of inaccessible address space aligned to `align`,
    /// preferably at `hint`. Nothing is committed.
    fn reserve_placeholder(&self, hint: Option<usize>, len: usize, align: usize)
    -> io::Result<usize>;

    /// Maps `len` read/write bytes backed by `page_size` pages. With `addr` the
    /// mapping replaces whatever the shim previously reserved there.
    fn map_pages(&self, addr: Option<usize>, len: usize, page_size: PageSize)
    -> io::Result<usize>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    fn release(&self, addr: usize, len: usize) -> io::Result<()>;

    /// Drops the contents of a range so the next touch reads zeros.
    fn discard(&self, addr: usize, len: usize) -> io::Result<()>;

    fn protect(&self, addr: usize, len: usize, prot: i32) -> io::Result<()>;

    fn advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()>;

    /// Copies `len` bytes between two live mappings.
    ///
    /// # Safety
    ///
    /// Both ranges must be mapped, readable/writable and must not overlap.
    unsafe fn copy(&self, src: usize, dst: usize, len: usize);

    /// Current program break of the process, used to place the heap arena.
    fn program_break(&self) -> usize;

    /// Free pages of `page_size` in the HugeTLB pool, when known.
    fn free_huge_pages(&self, page_size: PageSize) -> Option<usize>;
}

/// The real OS backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::ptr;

    use libc::{c_int, c_long};

    use super::{Kernel, PlatformMemory};
    use crate::config::PageSize;
    use crate::hugetlb::HugeTlb;
    use crate::utils::align_up;

    /// `mmap` through the raw syscall so preloaded hooks never see it.
    pub(crate) unsafe fn sys_mmap(
        addr: usize,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> io::Result<usize> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mmap,
                addr as c_long,
                len as c_long,
                prot as c_long,
                flags as c_long,
                fd as c_long,
                offset as c_long,
            )
        };

        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    pub(crate) unsafe fn sys_munmap(addr: usize, len: usize) -> io::Result<()> {
        let ret = unsafe { libc::syscall(libc::SYS_munmap, addr as c_long, len as c_long) };
        if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    pub(crate) unsafe fn sys_madvise(addr: usize, len: usize, advice: c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_madvise,
                addr as c_long,
                len as c_long,
                advice as c_long,
            )
        };
        if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    pub(crate) unsafe fn sys_mprotect(addr: usize, len: usize, prot: c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mprotect,
                addr as c_long,
                len as c_long,
                prot as c_long,
            )
        };
        if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    pub(crate) unsafe fn sys_mremap(
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: c_int,
        new_addr: usize,
    ) -> io::Result<usize> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mremap,
                old_addr as c_long,
                old_len as c_long,
                new_len as c_long,
                flags as c_long,
                new_addr as c_long,
            )
        };
        if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(ret as usize) }
    }

    /// Flags asking for `page_size` backing. `MAP_HUGE_*` encodes log2 of the
    /// size in the bits above `MAP_HUGE_SHIFT`.
    fn page_size_flags(page_size: PageSize) -> c_int {
        if page_size.is_huge() {
            libc::MAP_HUGETLB | ((page_size.shift() as c_int) << libc::MAP_HUGE_SHIFT)
        } else {
            libc::MAP_NORESERVE
        }
    }

    impl PlatformMemory for Kernel {
        fn reserve_placeholder(
            &self,
            hint: Option<usize>,
            len: usize,
            align: usize,
        ) -> io::Result<usize> {
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

            // Over-reserve by `align` and trim both ends so the result is aligned.
            let padded = len
                .checked_add(align)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
            let raw = unsafe { sys_mmap(hint.unwrap_or(0), padded, PROT, FLAGS, -1, 0)? };

            let start = align_up(raw, align);
            let head = start - raw;
            let tail = padded - head - len;

            unsafe {
                if head > 0 {
                    sys_munmap(raw, head)?;
                }
                if tail > 0 {
                    sys_munmap(start + len, tail)?;
                }
            }

            Ok(start)
        }

        fn map_pages(
            &self,
            addr: Option<usize>,
            len: usize,
            page_size: PageSize,
        ) -> io::Result<usize> {
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | page_size_flags(page_size);
            if addr.is_some() {
                flags |= libc::MAP_FIXED;
            }

            unsafe { sys_mmap(addr.unwrap_or(0), len, PROT, flags, -1, 0) }
        }

        fn release(&self, addr: usize, len: usize) -> io::Result<()> {
            unsafe { sys_munmap(addr, len) }
        }

        fn discard(&self, addr: usize, len: usize) -> io::Result<()> {
            unsafe { sys_madvise(addr, len, libc::MADV_DONTNEED) }
        }

        fn protect(&self, addr: usize, len: usize, prot: i32) -> io::Result<()> {
            unsafe { sys_mprotect(addr, len, prot) }
        }

        fn advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()> {
            unsafe { sys_madvise(addr, len, advice) }
        }

        unsafe fn copy(&self, src: usize, dst: usize, len: usize) {
            unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) }
        }

        fn program_break(&self) -> usize {
            // brk(0) never moves the break and returns the current one.
            unsafe { libc::syscall(libc::SYS_brk, 0 as c_long) as usize }
        }

        fn free_huge_pages(&self, page_size: PageSize) -> Option<usize> {
            HugeTlb::system().free_pages(page_size).ok()
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) use linux::{sys_madvise, sys_mmap, sys_mprotect, sys_mremap, sys_munmap};

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_aligned() {
        let align = 2 << 20;
        let addr = Kernel.reserve_placeholder(None, 4 << 20, align).unwrap();

        assert_eq!(addr % align, 0);
        Kernel.release(addr, 4 << 20).unwrap();
    }

    #[test]
    fn map_default_pages_over_placeholder() {
        let len = 64 << 10;
        let base = Kernel.reserve_placeholder(None, len, 4096).unwrap();
        let addr = Kernel.map_pages(Some(base), len, PageSize::Base4K).unwrap();
        assert_eq!(addr, base);

        unsafe {
            let bytes = addr as *mut u8;
            *bytes = 42;
            *bytes.add(len - 1) = 7;
            assert_eq!(*bytes, 42);
        }

        Kernel.discard(addr, len).unwrap();
        unsafe { assert_eq!(*(addr as *const u8), 0) };

        Kernel.release(addr, len).unwrap();
    }

    #[test]
    fn program_break_is_nonzero() {
        assert!(Kernel.program_break() > 0);
    }
}
