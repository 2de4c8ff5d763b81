//! POSIX syscall interception
//!
//! ABI-compatible replacements for the blocking POSIX surface. Each
//! exported symbol shadows its libc namesake at link time; user code
//! keeps calling plain `read(fd, ...)` and blocks as if on a kernel
//! thread while only its fiber is parked.
//!
//! Every operation runs through one template parameterized by:
//! - the syscall number,
//! - a kind (accept / read / write) selecting the post-syscall state
//!   transition,
//! - a non-blocking style: `Fcntl` sets O_NONBLOCK on the descriptor at
//!   first sight, `Sock` and `Msg` fold SOCK_NONBLOCK / MSG_DONTWAIT
//!   into an argument per call,
//! - the errno this operation uses for "would block".
//!
//! Calls from non-fiber threads (the runtime's own threads, any user
//! thread outside the fiber world, libstd internals) pass through to the
//! raw syscall untouched.

use crate::fdtable::{DirSide, FdEntry, WaitNode, IN_FLIGHT, PARKED, READY, UNCERTAIN};
use crate::fiber;
use crate::runtime::{self, RuntimeInner};
use crate::sys;
use crate::tls;
use libc::{c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};
use std::sync::atomic::Ordering;
use strand_core::state::FdLifecycle;

/// Post-syscall transition family.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Accept,
    Read,
    Write,
}

/// How this operation is made non-blocking.
#[derive(Clone, Copy, PartialEq, Eq)]
enum NbStyle {
    /// O_NONBLOCK on the descriptor, set once at first interception.
    Fcntl,
    /// SOCK_NONBLOCK folded into the flags argument (accept4). The
    /// listener still gets O_NONBLOCK: the fold only governs the
    /// accepted socket.
    Sock,
    /// MSG_DONTWAIT folded into the flags argument; no fcntl needed.
    Msg,
}

struct OpSpec {
    nr: libc::c_long,
    kind: OpKind,
    style: NbStyle,
    /// Additional errno meaning "would block" for this op
    /// (EAGAIN/EWOULDBLOCK are always recognized).
    wouldblock: i32,
}

const READ_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_read,
    kind: OpKind::Read,
    style: NbStyle::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};

const WRITE_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_write,
    kind: OpKind::Write,
    style: NbStyle::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};

const ACCEPT_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_accept,
    kind: OpKind::Accept,
    style: NbStyle::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};

const ACCEPT4_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_accept4,
    kind: OpKind::Accept,
    style: NbStyle::Sock,
    wouldblock: libc::EWOULDBLOCK,
};

const CONNECT_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_connect,
    kind: OpKind::Write,
    style: NbStyle::Fcntl,
    wouldblock: libc::EINPROGRESS,
};

const SENDTO_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_sendto,
    kind: OpKind::Write,
    style: NbStyle::Msg,
    wouldblock: libc::EWOULDBLOCK,
};

// Kind read is deliberate: recvfrom has no backpressure symmetry with
// file reads beyond "blocks on readability".
const RECVFROM_SPEC: OpSpec = OpSpec {
    nr: libc::SYS_recvfrom,
    kind: OpKind::Read,
    style: NbStyle::Msg,
    wouldblock: libc::EWOULDBLOCK,
};

/// Register a descriptor on first sight.
///
/// NOT_INITED is CAS-claimed to INITIALIZING; losers spin until the
/// winner settles the lifecycle. The winner resets both state machines,
/// applies O_NONBLOCK for fcntl-style ops, and tries an edge-triggered
/// EPOLL_CTL_ADD for both directions. EPERM means not pollable: the
/// descriptor is marked THREADPOOL and its syscalls are offloaded.
///
/// Idempotent once settled; any failure reverts to NOT_INITED so the
/// next caller re-probes (a closed fd surfaces EBADF here).
unsafe fn intercept_fd(
    rt: &RuntimeInner,
    fd: c_int,
    entry: &FdEntry,
    style: NbStyle,
) -> Result<FdLifecycle, i64> {
    loop {
        match entry.lifecycle() {
            FdLifecycle::NonBlocking => return Ok(FdLifecycle::NonBlocking),
            FdLifecycle::ThreadPool => return Ok(FdLifecycle::ThreadPool),
            FdLifecycle::Initializing => {
                std::hint::spin_loop();
                continue;
            }
            FdLifecycle::NotInited => {}
        }

        if entry
            .lifecycle
            .compare_exchange(
                FdLifecycle::NotInited as u32,
                FdLifecycle::Initializing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            continue;
        }

        entry.reset_states();

        if matches!(style, NbStyle::Fcntl | NbStyle::Sock) {
            let flags = sys::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 {
                entry
                    .lifecycle
                    .store(FdLifecycle::NotInited as u32, Ordering::Release);
                return Err(flags);
            }
            if flags & (libc::O_NONBLOCK as i64) == 0 {
                let ret = sys::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK as i64);
                if ret < 0 {
                    entry
                        .lifecycle
                        .store(FdLifecycle::NotInited as u32, Ordering::Release);
                    return Err(ret);
                }
            }
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        let ret = libc::epoll_ctl(rt.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev);
        if ret == 0 {
            entry
                .lifecycle
                .store(FdLifecycle::NonBlocking as u32, Ordering::Release);
            return Ok(FdLifecycle::NonBlocking);
        }
        match sys::errno() {
            // Not pollable: regular file or block device.
            libc::EPERM => {
                entry
                    .lifecycle
                    .store(FdLifecycle::ThreadPool as u32, Ordering::Release);
                return Ok(FdLifecycle::ThreadPool);
            }
            // Already registered: the fd was closed outside the
            // interceptor and recycled.
            libc::EEXIST => {
                entry
                    .lifecycle
                    .store(FdLifecycle::NonBlocking as u32, Ordering::Release);
                return Ok(FdLifecycle::NonBlocking);
            }
            errno => {
                entry
                    .lifecycle
                    .store(FdLifecycle::NotInited as u32, Ordering::Release);
                return Err(-(errno as i64));
            }
        }
    }
}

/// Public entry for internal users of the registration path (the poll
/// implementation registers its timers through this).
pub(crate) unsafe fn register_fd(rt: &RuntimeInner, fd: c_int) -> Result<FdLifecycle, i64> {
    match rt.table.get(fd) {
        Some(entry) => intercept_fd(rt, fd, entry, NbStyle::Fcntl),
        None => Err(-(libc::EBADF as i64)),
    }
}

enum Attempt {
    Done(i64),
    Again,
}

/// One pass of the readiness protocol on `side`.
///
/// PARKED publishes a stack wait-node, re-checks the state (the
/// no-lost-wakeup handshake with the event loop), parks, and asks the
/// caller to retry from the top. UNCERTAIN and READY are claimed into
/// IN_FLIGHT; an observed IN_FLIGHT race-proceeds, since an edge may
/// cover more than one consumer's worth of data.
unsafe fn attempt(
    rt: &RuntimeInner,
    spec: &OpSpec,
    fd: c_int,
    side: &DirSide,
    args: [u64; 6],
    requested: usize,
    user_nonblock: bool,
) -> Attempt {
    match side.state.load(Ordering::Acquire) {
        PARKED => {
            let mut node = WaitNode::new(tls::current_fiber());
            if !side.enqueue(&mut node) {
                return Attempt::Again;
            }
            if side.state.load(Ordering::Acquire) != PARKED {
                // The state moved between our load and the publish;
                // drain the list ourselves so no waiter (us included)
                // sleeps through the transition.
                side.schedule_waiters(rt, fd);
            }
            fiber::park_current();
            return Attempt::Again;
        }
        UNCERTAIN => {
            let _ = side
                .state
                .compare_exchange(UNCERTAIN, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire);
        }
        READY => {
            let _ = side
                .state
                .compare_exchange(READY, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire);
        }
        _ => {}
    }

    let ret = sys::raw(spec.nr, args);
    settle(spec, side, ret, requested, user_nonblock)
}

/// Post-syscall transition per operation kind.
unsafe fn settle(
    spec: &OpSpec,
    side: &DirSide,
    ret: i64,
    requested: usize,
    user_nonblock: bool,
) -> Attempt {
    let cas = |from: u32, to: u32| {
        let _ = side
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire);
    };

    let wouldblock = ret == -(libc::EAGAIN as i64)
        || ret == -(libc::EWOULDBLOCK as i64)
        || ret == -(spec.wouldblock as i64);

    if wouldblock {
        // The kernel is drained (or full); a future edge re-arms.
        cas(IN_FLIGHT, PARKED);
        if user_nonblock {
            // The caller asked for MSG_DONTWAIT semantics itself.
            return Attempt::Done(ret);
        }
        return Attempt::Again;
    }

    match spec.kind {
        OpKind::Accept => {
            if ret >= 0 {
                // The backlog may hold more connections.
                cas(IN_FLIGHT, UNCERTAIN);
            }
            // Errors pass through without a state change; the next
            // arrival or edge settles the machine.
            Attempt::Done(ret)
        }
        OpKind::Read | OpKind::Write => {
            if ret >= 0 {
                if ret as usize == requested {
                    // Full-length transfer: the caller's buffer capped
                    // the syscall, the kernel may hold more.
                    cas(IN_FLIGHT, UNCERTAIN);
                } else {
                    // Partial transfer asserts the drain.
                    cas(IN_FLIGHT, PARKED);
                }
                Attempt::Done(ret)
            } else if spec.wouldblock == libc::EINPROGRESS && ret == -(libc::EISCONN as i64) {
                // connect retried after its in-progress park completed.
                cas(IN_FLIGHT, UNCERTAIN);
                Attempt::Done(0)
            } else if spec.wouldblock == libc::EINPROGRESS && ret == -(libc::EALREADY as i64) {
                cas(IN_FLIGHT, PARKED);
                Attempt::Again
            } else {
                Attempt::Done(ret)
            }
        }
    }
}

/// The interception template shared by every wrapped operation.
unsafe fn intercept(spec: &OpSpec, fd: c_int, args: [u64; 6], requested: usize) -> i64 {
    let rt = match runtime::try_get() {
        Some(rt) if tls::in_fiber() => rt,
        _ => return sys::raw(spec.nr, args),
    };
    if rt.table.get(fd).is_none() {
        return sys::raw(spec.nr, args);
    }

    let user_nonblock =
        spec.style == NbStyle::Msg && args[3] & libc::MSG_DONTWAIT as u64 != 0;

    loop {
        // Re-entered after every park-wake: a descriptor closed while we
        // slept reads NOT_INITED here and surfaces EBADF from the probe.
        let entry = rt.table.get(fd).expect("fd bounds checked above");
        let lifecycle = match intercept_fd(rt, fd, entry, spec.style) {
            Ok(lifecycle) => lifecycle,
            Err(e) => return e,
        };

        if lifecycle == FdLifecycle::ThreadPool {
            return rt.offload.submit_and_wait(spec.nr, args);
        }

        let side = match spec.kind {
            OpKind::Write => &entry.writer,
            _ => &entry.reader,
        };

        let mut call_args = args;
        match spec.style {
            NbStyle::Sock => call_args[3] |= libc::SOCK_NONBLOCK as u64,
            NbStyle::Msg => call_args[3] |= libc::MSG_DONTWAIT as u64,
            NbStyle::Fcntl => {}
        }

        match attempt(rt, spec, fd, side, call_args, requested, user_nonblock) {
            Attempt::Done(ret) => return ret,
            Attempt::Again => {}
        }
    }
}

/// Fiber-side close: reset both machines, wake every waiter (they retry
/// and observe the closed descriptor), drop the lifecycle back to
/// NOT_INITED, then close for real. The epoll set drops the fd on the
/// final close by itself.
pub(crate) unsafe fn close_impl(rt: &RuntimeInner, fd: c_int) -> i64 {
    if let Some(entry) = rt.table.get(fd) {
        entry.reset_states();
        entry.reader.schedule_waiters(rt, fd);
        entry.writer.schedule_waiters(rt, fd);
        entry
            .lifecycle
            .store(FdLifecycle::NotInited as u32, Ordering::Release);
    }
    sys::raw(libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0])
}

// ── ABI exports ─────────────────────────────────────────────────────
//
// Signatures and errno conventions match the POSIX originals; negative
// kernel returns are translated to -1 + errno at this boundary.

#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    sys::to_abi(intercept(
        &READ_SPEC,
        fd,
        [fd as u64, buf as u64, count as u64, 0, 0, 0],
        count,
    ))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    sys::to_abi(intercept(
        &WRITE_SPEC,
        fd,
        [fd as u64, buf as u64, count as u64, 0, 0, 0],
        count,
    ))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(
    fd: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    sys::to_abi(intercept(
        &ACCEPT_SPEC,
        fd,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
        0,
    )) as c_int
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept4(
    fd: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    sys::to_abi(intercept(
        &ACCEPT4_SPEC,
        fd,
        [fd as u64, addr as u64, addrlen as u64, flags as u32 as u64, 0, 0],
        0,
    )) as c_int
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    sys::to_abi(intercept(
        &CONNECT_SPEC,
        fd,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
        0,
    )) as c_int
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    sys::to_abi(intercept(
        &SENDTO_SPEC,
        fd,
        [
            fd as u64,
            buf as u64,
            len as u64,
            flags as u32 as u64,
            dest_addr as u64,
            addrlen as u64,
        ],
        len,
    ))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    sys::to_abi(intercept(
        &RECVFROM_SPEC,
        fd,
        [
            fd as u64,
            buf as u64,
            len as u64,
            flags as u32 as u64,
            src_addr as u64,
            addrlen as u64,
        ],
        len,
    ))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    // The kernel implements recv as recvfrom with a null address.
    recvfrom(fd, buf, len, flags, std::ptr::null_mut(), std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poll(
    fds: *mut libc::pollfd,
    nfds: libc::nfds_t,
    timeout: c_int,
) -> c_int {
    match runtime::try_get() {
        Some(rt) if tls::in_fiber() => {
            sys::to_abi(crate::poll::poll_impl(rt, fds, nfds as usize, timeout)) as c_int
        }
        _ => sys::to_abi(sys::poll(fds, nfds as usize, timeout)) as c_int,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    match runtime::try_get() {
        Some(rt) if tls::in_fiber() => sys::to_abi(close_impl(rt, fd)) as c_int,
        _ => sys::to_abi(sys::raw(libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0])) as c_int,
    }
}
