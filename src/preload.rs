//! `LD_PRELOAD` interposer.
//!
//! Exports `brk`, `sbrk`, `mmap`, `munmap`, `mremap`, `mprotect` and `madvise`
//! from the shared object so dynamically linked programs call them instead of
//! libc's. A constructor bootstraps the shim before `main`; until it has
//! installed a context every hook forwards to the real symbol. In seccomp
//! mode no context is installed and the hooks stay forwarding, so the system
//! calls behind them reach the supervisor.
//!
//! ```text
//!  program --mmap()--> hook --context installed?--> intercept::sys_mmap --> router
//!                           \--no------------------> real!(mmap)
//! ```

#![allow(non_camel_case_types, non_upper_case_globals)]

use std::env;
use std::process;

use ctor::ctor;
use libc::{c_int, c_void, intptr_t, off_t, size_t};
use log::error;
use redhook::{hook, real};

use crate::context::{bootstrap, current, install};
use crate::error::ShimError;
use crate::intercept;
use crate::settings::{HookMode, LOG_VAR, ShimSettings};

/// Exit status of a process whose shim could not start.
const STARTUP_FAILURE: i32 = 127;

hook! {
    unsafe fn mmap(addr: *mut c_void,
                   len: size_t,
                   prot: c_int,
                   flags: c_int,
                   fd: c_int,
                   offset: off_t) -> *mut c_void => hpalloc_mmap {
        match current() {
            Some(context) => {
                intercept::sys_mmap(context.router(), addr, len, prot, flags, fd, offset)
            }
            None => unsafe { real!(mmap)(addr, len, prot, flags, fd, offset) },
        }
    }
}

hook! {
    unsafe fn munmap(addr: *mut c_void, len: size_t) -> c_int => hpalloc_munmap {
        match current() {
            Some(context) => intercept::sys_munmap(context.router(), addr, len),
            None => unsafe { real!(munmap)(addr, len) },
        }
    }
}

hook! {
    unsafe fn mremap(old_addr: *mut c_void,
                     old_len: size_t,
                     new_len: size_t,
                     flags: c_int,
                     new_addr: *mut c_void) -> *mut c_void => hpalloc_mremap {
        match current() {
            Some(context) => {
                intercept::sys_mremap(context.router(), old_addr, old_len, new_len, flags, new_addr)
            }
            None => unsafe { real!(mremap)(old_addr, old_len, new_len, flags, new_addr) },
        }
    }
}

hook! {
    unsafe fn mprotect(addr: *mut c_void, len: size_t, prot: c_int) -> c_int => hpalloc_mprotect {
        match current() {
            Some(context) => intercept::sys_mprotect(context.router(), addr, len, prot),
            None => unsafe { real!(mprotect)(addr, len, prot) },
        }
    }
}

hook! {
    unsafe fn madvise(addr: *mut c_void, len: size_t, advice: c_int) -> c_int => hpalloc_madvise {
        match current() {
            Some(context) => intercept::sys_madvise(context.router(), addr, len, advice),
            None => unsafe { real!(madvise)(addr, len, advice) },
        }
    }
}

hook! {
    unsafe fn brk(addr: *mut c_void) -> c_int => hpalloc_brk {
        match current() {
            Some(context) => intercept::sys_brk(context.router(), addr),
            None => unsafe { real!(brk)(addr) },
        }
    }
}

hook! {
    unsafe fn sbrk(increment: intptr_t) -> *mut c_void => hpalloc_sbrk {
        match current() {
            Some(context) => intercept::sys_sbrk(context.router(), increment),
            None => unsafe { real!(sbrk)(increment) },
        }
    }
}

fn init_logging() {
    if env::var_os(LOG_VAR).is_some() {
        let env = env_logger::Env::new().filter(LOG_VAR);
        let _ = env_logger::Builder::from_env(env).try_init();
    }
}

fn start() -> Result<(), ShimError> {
    let settings = ShimSettings::from_env()?;
    let context = bootstrap(&settings)?;

    match settings.hooks {
        HookMode::Preload => {
            install(context)?;
        }
        #[cfg(feature = "seccomp")]
        HookMode::Seccomp => crate::seccomp::start(context)?,
        #[cfg(not(feature = "seccomp"))]
        HookMode::Seccomp => {
            log::warn!("built without seccomp support, libc's internal heap growth stays unrouted");
            install(context)?;
        }
    }
    Ok(())
}

#[ctor]
unsafe fn hpalloc_start() {
    init_logging();

    if let Err(e) = start() {
        error!("{}", e);
        eprintln!("{}", e);
        process::exit(STARTUP_FAILURE);
    }
}
