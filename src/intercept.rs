//! The boundary between the replaced C primitives and the router.
//!
//! [`Interceptor`] is the Rust view of the seven primitives the shim takes
//! over. The `sys_*` functions below translate between that view and the C
//! calling conventions: raw pointers in, `MAP_FAILED` / `(void *) -1` / `-1`
//! out with `errno` set. They hold no lock of their own, so a hook running
//! on any thread can call them.

use std::process;

use libc::{c_int, c_void, intptr_t, off_t, size_t};
use log::error;
use nix::errno::Errno;

use crate::error::RouteError;
use crate::request::{AllocationRequest, RemapFlags};
use crate::router::Router;

/// Entry points of the intercepted primitives.
pub trait Interceptor: Send + Sync {
    /// `sbrk(delta)`: returns the previous break.
    fn on_heap_growth(&self, delta: isize) -> Result<usize, Errno>;

    /// `brk(addr)`: returns the new break.
    fn on_set_break(&self, addr: usize) -> Result<usize, Errno>;

    fn on_anonymous_map(&self, request: &AllocationRequest) -> Result<usize, Errno>;

    fn on_free(&self, addr: usize, len: usize) -> Result<(), Errno>;

    fn on_remap(
        &self,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: RemapFlags,
        new_addr: usize,
    ) -> Result<usize, Errno>;

    fn on_protect(&self, addr: usize, len: usize, prot: c_int) -> Result<(), Errno>;

    fn on_advise(&self, addr: usize, len: usize, advice: c_int) -> Result<(), Errno>;
}

/// Turns a routing failure into the errno the program sees.
///
/// Aliasing means two owners for the same bytes. Carrying on would corrupt
/// the program's memory, so the process is stopped instead.
fn to_errno(e: RouteError) -> Errno {
    if let RouteError::Aliasing { .. } = e {
        error!("{}", e);
        process::abort();
    }
    e.errno()
}

impl Interceptor for Router {
    fn on_heap_growth(&self, delta: isize) -> Result<usize, Errno> {
        self.heap_growth(delta).map_err(to_errno)
    }

    fn on_set_break(&self, addr: usize) -> Result<usize, Errno> {
        self.set_break(addr).map_err(to_errno)
    }

    fn on_anonymous_map(&self, request: &AllocationRequest) -> Result<usize, Errno> {
        self.map(request).map_err(to_errno)
    }

    fn on_free(&self, addr: usize, len: usize) -> Result<(), Errno> {
        self.free(addr, len).map_err(to_errno)
    }

    fn on_remap(
        &self,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: RemapFlags,
        new_addr: usize,
    ) -> Result<usize, Errno> {
        self.remap(old_addr, old_len, new_len, flags, new_addr)
            .map_err(to_errno)
    }

    fn on_protect(&self, addr: usize, len: usize, prot: c_int) -> Result<(), Errno> {
        self.protect(addr, len, prot).map_err(to_errno)
    }

    fn on_advise(&self, addr: usize, len: usize, advice: c_int) -> Result<(), Errno> {
        self.advise(addr, len, advice).map_err(to_errno)
    }
}

#[inline]
fn set_errno(errno: Errno) {
    unsafe { *libc::__errno_location() = errno as c_int };
}

/// `-1` as a pointer, what `sbrk` returns on failure.
const SBRK_FAILED: *mut c_void = usize::MAX as *mut c_void;

#[inline]
fn status(result: Result<(), Errno>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(errno) => {
            set_errno(errno);
            -1
        }
    }
}

pub fn sys_sbrk(interceptor: &dyn Interceptor, increment: intptr_t) -> *mut c_void {
    match interceptor.on_heap_growth(increment as isize) {
        Ok(old) => old as *mut c_void,
        Err(errno) => {
            set_errno(errno);
            SBRK_FAILED
        }
    }
}

/// `brk(NULL)` moves nothing and succeeds.
pub fn sys_brk(interceptor: &dyn Interceptor, addr: *mut c_void) -> c_int {
    if addr.is_null() {
        return 0;
    }
    status(interceptor.on_set_break(addr as usize).map(|_| ()))
}

pub fn sys_mmap(
    interceptor: &dyn Interceptor,
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let request = AllocationRequest::from_mmap(addr as usize, len, prot, flags, fd, offset);
    match interceptor.on_anonymous_map(&request) {
        Ok(addr) => addr as *mut c_void,
        Err(errno) => {
            set_errno(errno);
            libc::MAP_FAILED
        }
    }
}

pub fn sys_munmap(interceptor: &dyn Interceptor, addr: *mut c_void, len: size_t) -> c_int {
    status(interceptor.on_free(addr as usize, len))
}

pub fn sys_mremap(
    interceptor: &dyn Interceptor,
    old_addr: *mut c_void,
    old_len: size_t,
    new_len: size_t,
    flags: c_int,
    new_addr: *mut c_void,
) -> *mut c_void {
    let result = interceptor.on_remap(
        old_addr as usize,
        old_len,
        new_len,
        RemapFlags::from_raw(flags),
        new_addr as usize,
    );
    match result {
        Ok(addr) => addr as *mut c_void,
        Err(errno) => {
            set_errno(errno);
            libc::MAP_FAILED
        }
    }
}

pub fn sys_mprotect(
    interceptor: &dyn Interceptor,
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
) -> c_int {
    status(interceptor.on_protect(addr as usize, len, prot))
}

pub fn sys_madvise(
    interceptor: &dyn Interceptor,
    addr: *mut c_void,
    len: size_t,
    advice: c_int,
) -> c_int {
    status(interceptor.on_advise(addr as usize, len, advice))
}

/// Serves a trapped system call `nr` with the kernel's own conventions:
/// the raw return value, or the errno to fail with. `None` for calls the shim
/// does not take over.
///
/// Unlike the libc wrapper, the `brk` system call never fails. It returns the
/// resulting break, which is the old one when the move was refused.
pub fn dispatch_syscall(
    interceptor: &dyn Interceptor,
    nr: i64,
    args: &[u64; 6],
) -> Option<Result<i64, Errno>> {
    let result = match nr {
        n if n == libc::SYS_brk => {
            let addr = args[0] as usize;
            let brk = if addr == 0 {
                interceptor.on_heap_growth(0)
            } else {
                interceptor
                    .on_set_break(addr)
                    .or_else(|_| interceptor.on_heap_growth(0))
            };
            brk.map(|addr| addr as i64)
        }
        n if n == libc::SYS_mmap => {
            let request = AllocationRequest::from_mmap(
                args[0] as usize,
                args[1] as usize,
                args[2] as c_int,
                args[3] as c_int,
                args[4] as c_int,
                args[5] as i64,
            );
            interceptor
                .on_anonymous_map(&request)
                .map(|addr| addr as i64)
        }
        n if n == libc::SYS_munmap => interceptor
            .on_free(args[0] as usize, args[1] as usize)
            .map(|()| 0),
        n if n == libc::SYS_mremap => interceptor
            .on_remap(
                args[0] as usize,
                args[1] as usize,
                args[2] as usize,
                RemapFlags::from_raw(args[3] as c_int),
                args[4] as usize,
            )
            .map(|addr| addr as i64),
        n if n == libc::SYS_mprotect => interceptor
            .on_protect(args[0] as usize, args[1] as usize, args[2] as c_int)
            .map(|()| 0),
        n if n == libc::SYS_madvise => interceptor
            .on_advise(args[0] as usize, args[1] as usize, args[2] as c_int)
            .map(|()| 0),
        _ => return None,
    };
    Some(result)
}
