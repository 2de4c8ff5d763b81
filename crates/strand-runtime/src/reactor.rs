//! Event loop: the epoll demultiplexer
//!
//! One dedicated OS thread, never running user fibers, sole consumer of
//! the epoll set. Readiness is translated into descriptor state-machine
//! transitions; woken waiters are pushed onto their owner workers'
//! queues. Two fds are matched by value before the table lookup: the
//! terminate event (shutdown) and the signalfd (AIO completions).

use crate::config::EPOLL_BATCH;
use crate::runtime::RuntimeInner;
use crate::signal;
use crate::sys;
use strand_core::state::FdLifecycle;
use strand_core::{fdebug, ferror};

pub(crate) fn reactor_loop(rt: &'static RuntimeInner) {
    fdebug!("reactor started");

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EPOLL_BATCH];

    loop {
        let n = unsafe {
            libc::epoll_wait(rt.epoll_fd, events.as_mut_ptr(), EPOLL_BATCH as i32, -1)
        };
        if n < 0 {
            let errno = sys::errno();
            if errno == libc::EINTR {
                continue;
            }
            ferror!("epoll_wait failed: errno {}", errno);
            return;
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as i32;

            if fd == rt.terminate.fd() {
                // Process-wide shutdown: release every worker from its
                // queue sleep; they observe the zero live count and exit.
                for worker in rt.workers.iter() {
                    worker.event.trigger();
                }
                fdebug!("reactor shutdown");
                return;
            }

            if fd == rt.signal_fd {
                signal::drain(rt);
                continue;
            }

            let entry = match rt.table.get(fd) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.lifecycle() != FdLifecycle::NonBlocking {
                continue;
            }

            // ERR/HUP wake both directions so parked fibers re-probe and
            // surface the real errno.
            let bits = ev.events as i32;
            if bits & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                entry.reader.on_event(rt, fd);
            }
            if bits & (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                entry.writer.on_event(rt, fd);
            }
        }
    }
}
