//! Seccomp user-notification hooks.
//!
//! glibc's `malloc` grows the heap through its internal `__brk`, which no
//! exported symbol can replace. In this mode the start-up thread loads a
//! filter that turns the memory system calls of every thread it starts into
//! notifications. A supervisor thread, spawned before the filter and so not
//! subject to it, serves them with the router in the same address space.
//!
//! ```text
//!  app thread --brk()--> kernel --notification--> supervisor --> router
//!       ^                                             |
//!       +------------------- response ----------------+
//! ```

use std::mem;
use std::os::fd::RawFd;
use std::sync::mpsc::sync_channel;
use std::thread;

use libseccomp::notify::{ScmpNotifReq, ScmpNotifResp};
use libseccomp::{ScmpAction, ScmpArch, ScmpFilterContext, ScmpSyscall};
use log::{debug, info};
use nix::errno::Errno;

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::intercept::dispatch_syscall;

const TRAPPED: [&str; 6] = ["brk", "mmap", "munmap", "mremap", "mprotect", "madvise"];

/// Hands `context` to a supervisor thread and loads the filter on the
/// calling thread. Only threads started afterwards inherit it, so this has to
/// run before the program starts any.
pub(crate) fn start(context: ShimContext) -> Result<(), ShimError> {
    let (fd_tx, fd_rx) = sync_channel::<RawFd>(0);

    thread::Builder::new()
        .name("hpalloc-seccomp".to_string())
        .spawn(move || {
            if let Ok(fd) = fd_rx.recv() {
                supervise(&context, fd);
            }
        })
        .map_err(ShimError::Supervisor)?;

    let mut filter = ScmpFilterContext::new_filter(ScmpAction::Allow)?;
    filter.add_arch(ScmpArch::Native)?;
    for name in TRAPPED {
        filter.add_rule(ScmpAction::Notify, ScmpSyscall::from_name(name)?)?;
    }
    filter.load()?;

    let fd = filter.get_notify_fd()?;
    // The kernel keeps the loaded filter; the notification fd has to outlive
    // the context that owns it.
    mem::forget(filter);

    fd_tx.send(fd).map_err(|_| {
        ShimError::Supervisor(std::io::Error::other("supervisor exited before start-up"))
    })?;
    info!("seccomp hooks active on fd {}", fd);
    Ok(())
}

fn supervise(context: &ShimContext, fd: RawFd) -> ! {
    loop {
        let req = match ScmpNotifReq::receive(fd) {
            Ok(req) => req,
            Err(e) => {
                // The notifying thread may have died in the meantime.
                debug!("lost a notification: {}", e);
                continue;
            }
        };

        let nr = i64::from(req.data.syscall.as_raw_syscall());
        let (val, error) = match dispatch_syscall(context.router(), nr, &req.data.args) {
            Some(Ok(val)) => (val, 0),
            Some(Err(errno)) => (0, -(errno as i32)),
            None => (0, -(Errno::ENOSYS as i32)),
        };

        if let Err(e) = ScmpNotifResp::new(req.id, val, error, 0).respond(fd) {
            debug!("response to thread {} dropped: {}", req.pid, e);
        }
    }
}
