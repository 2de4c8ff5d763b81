//! Intercepted poll
//!
//! Three tiers, cheapest first:
//!
//! 1. Fast path: scan the descriptor table without syscalls. READY
//!    states become revents bits; parked states mean "not ready". If
//!    every observed state is conclusive and at least one fd is ready,
//!    return. An in-flight or uncertain state downgrades to a raw
//!    zero-timeout probe.
//! 2. timeout == 0: the probe result is the answer.
//! 3. Slow path: plant one wait-node per requested direction per fd,
//!    arm a one-shot timer registered in the descriptor table like any
//!    other fd, park once. The wake fd tells timeouts from readiness.
//!
//! With no fds at all, poll degenerates to a fiber sleep on the timer's
//! descriptor entry.

use crate::fdtable::{FdEntry, WaitNode, PARKED, READY};
use crate::fiber;
use crate::runtime::RuntimeInner;
use crate::syscall::{close_impl, register_fd};
use crate::sys;
use crate::tls;
use crate::wake::OneShotTimer;
use libc::c_int;
use std::sync::atomic::Ordering;
use strand_core::state::FdLifecycle;

/// Scan once without syscalls. Returns whether every observed state was
/// conclusive (READY or parked) and the count of ready fds; fills
/// revents as it goes.
unsafe fn fast_scan(rt: &RuntimeInner, fds: &mut [libc::pollfd]) -> (bool, i64) {
    let mut conclusive = true;
    let mut count = 0i64;

    for pfd in fds.iter_mut() {
        pfd.revents = 0;
        if pfd.fd < 0 {
            continue;
        }
        let entry = match rt.table.get(pfd.fd) {
            Some(entry) => entry,
            None => {
                conclusive = false;
                continue;
            }
        };
        if entry.lifecycle() != FdLifecycle::NonBlocking {
            // Never intercepted (or offloaded): the table knows nothing.
            conclusive = false;
            continue;
        }

        if pfd.events & libc::POLLIN != 0 {
            match entry.reader.state.load(Ordering::Acquire) {
                READY => pfd.revents |= libc::POLLIN,
                PARKED => {}
                _ => conclusive = false,
            }
        }
        if pfd.events & libc::POLLOUT != 0 {
            match entry.writer.state.load(Ordering::Acquire) {
                READY => pfd.revents |= libc::POLLOUT,
                PARKED => {}
                _ => conclusive = false,
            }
        }

        if pfd.revents != 0 {
            count += 1;
        }
    }
    (conclusive, count)
}

/// Plant a wait-node and run the enqueue-then-recheck handshake; a state
/// that moved is drained so nobody sleeps through the transition.
unsafe fn plant(
    rt: &RuntimeInner,
    side: &crate::fdtable::DirSide,
    node: *mut WaitNode,
    fd: c_int,
) {
    loop {
        if side.enqueue(node) {
            if side.state.load(Ordering::Acquire) != PARKED {
                side.schedule_waiters(rt, fd);
            }
            return;
        }
    }
}

/// Sleep for `timeout` ms on a fresh timer routed through the normal
/// readiness machinery. The zero-fd poll shape.
unsafe fn sleep_on_timer(rt: &RuntimeInner, timeout: c_int) -> i64 {
    let timer = match OneShotTimer::new() {
        Ok(timer) => timer,
        Err(strand_core::RuntimeError::Setup(_, errno)) => return -(errno as i64),
        Err(_) => return -(libc::EINVAL as i64),
    };
    timer.arm(timeout as u64);

    if let Err(e) = register_fd(rt, timer.fd()) {
        return e;
    }
    let entry = rt.table.get(timer.fd()).expect("timer fd in table");

    let mut node = WaitNode::new(tls::current_fiber());
    plant(rt, &entry.reader, &mut node, timer.fd());
    loop {
        fiber::park_current();
        // Confirm expiry from the timerfd itself; a wake without one is
        // a stale waker from an earlier multi-list park, and the timer
        // node is still linked, so parking again is safe.
        let mut expirations: u64 = 0;
        let n = sys::read(timer.fd(), &mut expirations as *mut u64 as *mut u8, 8);
        if n == 8 && expirations > 0 {
            break;
        }
    }

    // Reset the table entry before the fd number can recycle.
    close_impl(rt, timer.into_fd());
    0
}

pub(crate) unsafe fn poll_impl(
    rt: &RuntimeInner,
    fds: *mut libc::pollfd,
    nfds: usize,
    timeout: c_int,
) -> i64 {
    if nfds == 0 || fds.is_null() {
        if timeout <= 0 {
            return sys::poll(std::ptr::null_mut(), 0, 0);
        }
        return sleep_on_timer(rt, timeout);
    }

    let fds = std::slice::from_raw_parts_mut(fds, nfds);

    let (conclusive, count) = fast_scan(rt, fds);
    if conclusive && count > 0 {
        return count;
    }
    if !conclusive {
        // One-shot probe settles the in-flight states.
        let ret = sys::poll(fds.as_mut_ptr(), nfds, 0);
        if ret != 0 {
            return ret;
        }
    }
    if timeout == 0 {
        return sys::poll(fds.as_mut_ptr(), nfds, 0);
    }

    // Slow path: park on every requested direction at once. A negative
    // timeout parks without a timer until some fd wakes us.
    //
    // Capacity covers every possible node up front: published nodes are
    // linked into wait lists by address and must never move.
    let fiber = tls::current_fiber();
    let mut nodes: Vec<WaitNode> = Vec::with_capacity(2 * nfds + 1);
    let mut planted: Vec<(i32, bool)> = Vec::with_capacity(2 * nfds);

    for pfd in fds.iter() {
        if pfd.fd < 0 {
            continue;
        }
        if register_fd(rt, pfd.fd).is_err() {
            continue;
        }
        let entry: &FdEntry = match rt.table.get(pfd.fd) {
            Some(entry) if entry.lifecycle() == FdLifecycle::NonBlocking => entry,
            // THREADPOOL fds report ready from the raw probe above and
            // never reach here with interest pending.
            _ => continue,
        };
        if pfd.events & libc::POLLIN != 0 {
            nodes.push(WaitNode::new(fiber));
            let node = nodes.last_mut().expect("just pushed") as *mut WaitNode;
            plant(rt, &entry.reader, node, pfd.fd);
            planted.push((pfd.fd, true));
        }
        if pfd.events & libc::POLLOUT != 0 {
            nodes.push(WaitNode::new(fiber));
            let node = nodes.last_mut().expect("just pushed") as *mut WaitNode;
            plant(rt, &entry.writer, node, pfd.fd);
            planted.push((pfd.fd, false));
        }
    }

    let timer = if timeout > 0 {
        match OneShotTimer::new() {
            Ok(timer) => {
                timer.arm(timeout as u64);
                if register_fd(rt, timer.fd()).is_ok() {
                    let entry = rt.table.get(timer.fd()).expect("timer fd in table");
                    nodes.push(WaitNode::new(fiber));
                    let node = nodes.last_mut().expect("just pushed") as *mut WaitNode;
                    plant(rt, &entry.reader, node, timer.fd());
                    Some(timer)
                } else {
                    None
                }
            }
            Err(_) => None,
        }
    } else {
        None
    };

    if planted.is_empty() && timer.is_none() {
        // No list will ever wake us (nothing registrable and no timer);
        // answer from a raw probe instead of parking forever.
        return sys::poll(fds.as_mut_ptr(), nfds, 0);
    }

    fiber::park_current();
    let wake_fd = (*fiber).wake_fd.load(Ordering::Acquire);

    // The nodes above die with this frame: pull them out of every list
    // they were planted on. The direction that woke us already stole its
    // node; the rest are drained here, waking co-waiters spuriously
    // (their retry loops re-park them).
    for &(fd, is_reader) in &planted {
        if let Some(entry) = rt.table.get(fd) {
            let side = if is_reader { &entry.reader } else { &entry.writer };
            side.schedule_waiters_except(rt, fd, fiber);
        }
    }

    let timed_out = if let Some(timer) = timer {
        timer.disarm();
        let timer_fd = timer.fd();
        // Single owner of the timer's wait head at this point; the
        // discard also unlinks our node if the timer never fired.
        if let Some(entry) = rt.table.get(timer_fd) {
            entry.reader.steal_waiters();
        }
        close_impl(rt, timer.into_fd());
        wake_fd == timer_fd
    } else {
        false
    };
    if timed_out {
        return 0;
    }

    let (_, count) = fast_scan(rt, fds);
    count
}
