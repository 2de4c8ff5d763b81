//! Signal bridge: AIO completion routing over signalfd
//!
//! Signal 42 is reserved for kernel AIO completion delivery. It is
//! blocked process-wide at startup and consumed exclusively through a
//! signalfd in the event loop; `ssi_ptr` carries the fiber handle the
//! submitter placed in `sigev_value.sival_ptr`. SIGTERM gets a handler
//! that exits the process immediately.

use crate::fiber::Fiber;
use crate::runtime::RuntimeInner;
use crate::sys;
use std::os::unix::io::RawFd;
use strand_core::error::{RuntimeError, RuntimeResult};

/// The realtime signal reserved for AIO completion routing.
pub const WAKE_SIGNAL: libc::c_int = 42;

/// signalfd_siginfo records consumed per event-loop pass.
const SIGINFO_BATCH: usize = 20;

/// Block the wake signal, open the signalfd, install the SIGTERM
/// handler. Runs before any runtime thread is spawned so the mask is
/// inherited everywhere.
pub(crate) fn setup() -> RuntimeResult<RawFd> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, WAKE_SIGNAL);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(RuntimeError::Setup("pthread_sigmask", sys::errno()));
        }

        let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(RuntimeError::Setup("signalfd", sys::errno()));
        }

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_sigterm as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut()) != 0 {
            let errno = sys::errno();
            sys::close(fd);
            return Err(RuntimeError::Setup("sigaction(SIGTERM)", errno));
        }

        Ok(fd)
    }
}

extern "C" fn on_sigterm(_sig: libc::c_int) {
    unsafe {
        libc::_exit(9);
    }
}

/// Consume pending siginfo records and schedule the carried fibers.
/// Called by the event loop when the signalfd reports readable.
pub(crate) fn drain(rt: &RuntimeInner) {
    let mut buf: [libc::signalfd_siginfo; SIGINFO_BATCH] = unsafe { std::mem::zeroed() };
    let n = unsafe {
        sys::read(
            rt.signal_fd,
            buf.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(&buf),
        )
    };
    if n <= 0 {
        return;
    }

    let count = n as usize / std::mem::size_of::<libc::signalfd_siginfo>();
    for si in &buf[..count] {
        if si.ssi_signo == WAKE_SIGNAL as u32 && si.ssi_ptr != 0 {
            rt.schedule(si.ssi_ptr as *mut Fiber, -1);
        }
    }
}
