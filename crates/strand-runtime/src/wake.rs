//! Raw wakeables: eventfd binary event and timerfd one-shot timer
//!
//! `Event` is the single wake primitive the runtime uses everywhere: a
//! worker sleeps on its queue event, the event loop is shut down through
//! the terminate event, the offload pool sleeps on its own. Coalescing
//! comes for free from eventfd counter semantics: any number of triggers
//! before the consumer reads collapse into one wake.
//!
//! `OneShotTimer` backs poll timeouts. An armed timer's fd sits in the
//! descriptor table like any other descriptor and delivers its expiry
//! through the normal readiness machinery.

use crate::sys;
use std::os::unix::io::RawFd;
use strand_core::ferror;
use strand_core::error::{RuntimeError, RuntimeResult};

/// Binary event backed by an eventfd with counter semantics.
pub struct Event {
    fd: RawFd,
}

impl Event {
    /// Create a new event, initially untriggered.
    ///
    /// The eventfd is blocking: `wait_and_reset` parks the calling OS
    /// thread in the kernel until a trigger arrives.
    pub fn new() -> RuntimeResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(RuntimeError::Setup("eventfd", sys::errno()));
        }
        Ok(Self { fd })
    }

    /// Get the raw descriptor (for epoll registration).
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Signal the event. Retries on EINTR; a counter-overflow EAGAIN
    /// means a wake is already pending, which is all a trigger needs.
    pub fn trigger(&self) {
        let val: u64 = 1;
        loop {
            let ret = unsafe { sys::write(self.fd, &val as *const u64 as *const u8, 8) };
            if ret == 8 {
                return;
            }
            match (-ret) as i32 {
                libc::EINTR => continue,
                libc::EAGAIN => return,
                e => {
                    ferror!("event trigger on fd {} failed: errno {}", self.fd, e);
                    return;
                }
            }
        }
    }

    /// Block until triggered, consuming the trigger. No spurious wakes:
    /// the 8-byte read observes and resets the counter atomically.
    pub fn wait_and_reset(&self) {
        let mut val: u64 = 0;
        loop {
            let ret = unsafe { sys::read(self.fd, &mut val as *mut u64 as *mut u8, 8) };
            if ret == 8 {
                return;
            }
            if (-ret) as i32 == libc::EINTR {
                continue;
            }
            ferror!("event wait on fd {} failed: errno {}", self.fd, (-ret) as i32);
            return;
        }
    }

    /// Close the underlying descriptor.
    pub fn dispose(&mut self) {
        if self.fd >= 0 {
            unsafe {
                sys::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// One-shot monotonic timer backed by a non-blocking timerfd.
pub struct OneShotTimer {
    fd: RawFd,
}

impl OneShotTimer {
    pub fn new() -> RuntimeResult<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(RuntimeError::Setup("timerfd_create", sys::errno()));
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Arm for a single expiry `ms` milliseconds from now.
    pub fn arm(&self, ms: u64) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (ms / 1000) as libc::time_t,
                tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret != 0 {
            ferror!("timerfd_settime(arm) on fd {} failed: errno {}", self.fd, sys::errno());
        }
    }

    /// Cancel any pending expiry.
    pub fn disarm(&self) {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret != 0 {
            ferror!("timerfd_settime(disarm) on fd {} failed: errno {}", self.fd, sys::errno());
        }
    }

    /// Close the underlying descriptor.
    ///
    /// Callers that registered the timer in the descriptor table must
    /// reset the table entry first (the fd number recycles immediately);
    /// the poll path does this through the interceptor's close routine.
    pub fn dispose(&mut self) {
        if self.fd >= 0 {
            unsafe {
                sys::close(self.fd);
            }
            self.fd = -1;
        }
    }

    /// Hand ownership of the descriptor to the caller without closing.
    pub(crate) fn into_fd(mut self) -> RawFd {
        let fd = self.fd;
        self.fd = -1;
        fd
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_trigger_then_wait() {
        let ev = Event::new().unwrap();
        ev.trigger();
        // Trigger is already pending, so this must not block.
        ev.wait_and_reset();
    }

    #[test]
    fn test_event_coalesces() {
        let ev = Event::new().unwrap();
        ev.trigger();
        ev.trigger();
        ev.trigger();
        // All three collapse into a single pending wake.
        ev.wait_and_reset();
        // The counter is reset: a new trigger is observed again.
        ev.trigger();
        ev.wait_and_reset();
    }

    #[test]
    fn test_timer_fires() {
        let timer = OneShotTimer::new().unwrap();
        timer.arm(10);
        let mut pfd = libc::pollfd {
            fd: timer.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { sys::poll(&mut pfd, 1, 1000) };
        assert_eq!(ret, 1);
        assert_ne!(pfd.revents & libc::POLLIN, 0);
    }

    #[test]
    fn test_timer_disarm() {
        let timer = OneShotTimer::new().unwrap();
        timer.arm(20);
        timer.disarm();
        let mut pfd = libc::pollfd {
            fd: timer.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { sys::poll(&mut pfd, 1, 60) };
        assert_eq!(ret, 0);
    }
}
