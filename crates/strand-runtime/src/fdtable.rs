//! Descriptor table: per-fd readiness machines and wait lists
//!
//! One entry per possible descriptor, indexed by fd, in a process-wide
//! anonymous mapping sized to RLIMIT_NOFILE. Each entry carries two
//! independent four-state machines (reader and writer side) plus one
//! lock-free LIFO wait list per side.
//!
//! The states encode the runtime's belief about kernel readiness under
//! edge-triggered epoll. Numeric values align across directions:
//!
//! ```text
//! 0 PARKED     reader EMPTY / writer FULL    parking is correct
//! 1 UNCERTAIN  kernel depth unknown          next syscall probes
//! 2 IN_FLIGHT  reader READING / writer WRITING
//! 3 READY      an unconsumed epoll edge
//! ```
//!
//! Wait lists follow a steal-then-schedule discipline: a scheduler swaps
//! the whole list head to null, then for each stolen node steals the
//! fiber pointer with a CAS. Nodes live on the stacks of suspended
//! fibers; once a fiber resumes, its node is dead and only the stealing
//! pass may have touched it.

use crate::fiber::Fiber;
use crate::runtime::RuntimeInner;
use crate::sys;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use strand_core::state::{FdLifecycle, ReadState, WriteState};

/// Direction-agnostic state values; see the module header.
pub const PARKED: u32 = ReadState::Empty as u32;
pub const UNCERTAIN: u32 = ReadState::Uncertain as u32;
pub const IN_FLIGHT: u32 = ReadState::Reading as u32;
pub const READY: u32 = ReadState::Ready as u32;

// The engine below relies on both direction enums sharing the lattice.
const _: () = {
    assert!(WriteState::Full as u32 == PARKED);
    assert!(WriteState::Uncertain as u32 == UNCERTAIN);
    assert!(WriteState::Writing as u32 == IN_FLIGHT);
    assert!(WriteState::Ready as u32 == READY);
};

/// Per-parked-fiber record, linked into one wait list.
///
/// Lives on the suspended fiber's stack from enqueue until the fiber
/// resumes. The fiber pointer is stolen (CAS to null) by whichever
/// scheduler wakes the fiber, so a fiber enqueued on several lists at
/// once is still woken at most once per waker pass.
#[repr(C)]
pub struct WaitNode {
    fiber: AtomicPtr<Fiber>,
    next: AtomicPtr<WaitNode>,
}

impl WaitNode {
    pub fn new(fiber: *mut Fiber) -> Self {
        Self {
            fiber: AtomicPtr::new(fiber),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// One direction (reader or writer side) of a descriptor entry.
pub struct DirSide {
    pub state: AtomicU32,
    waiters: AtomicPtr<WaitNode>,
}

impl DirSide {
    /// Push a node at the head of the wait list. A failed CAS means a
    /// concurrent push won; the caller restarts its whole attempt.
    pub fn enqueue(&self, node: *mut WaitNode) -> bool {
        let head = self.waiters.load(Ordering::Acquire);
        unsafe {
            (*node).next.store(head, Ordering::Relaxed);
        }
        self.waiters
            .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Steal the whole wait list.
    pub fn steal_waiters(&self) -> *mut WaitNode {
        self.waiters.swap(std::ptr::null_mut(), Ordering::AcqRel)
    }

    /// Steal the list and hand every still-claimable fiber to `sched`
    /// with `wake_fd` recorded.
    fn schedule_waiters_with<F>(&self, wake_fd: i32, mut sched: F)
    where
        F: FnMut(*mut Fiber, i32),
    {
        let mut node = self.steal_waiters();
        while !node.is_null() {
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            let fiber = unsafe {
                (*node)
                    .fiber
                    .swap(std::ptr::null_mut(), Ordering::AcqRel)
            };
            if !fiber.is_null() {
                sched(fiber, wake_fd);
            }
            node = next;
        }
    }

    /// Steal the list and schedule every waiter onto its owner worker.
    pub fn schedule_waiters(&self, rt: &RuntimeInner, wake_fd: i32) {
        self.schedule_waiters_with(wake_fd, |fiber, wfd| rt.schedule(fiber, wfd));
    }

    /// Steal the list, schedule every waiter except `except`.
    ///
    /// Lets a multi-list waiter (poll) pull its own nodes out of every
    /// list it touched before its frame dies: its entries are unlinked
    /// without a self-wake, co-waiters get a spurious wake their retry
    /// loops absorb.
    pub fn schedule_waiters_except(&self, rt: &RuntimeInner, wake_fd: i32, except: *mut Fiber) {
        self.schedule_waiters_with(wake_fd, |fiber, wfd| {
            if fiber != except {
                rt.schedule(fiber, wfd);
            }
        });
    }

    /// Event-loop transition for one epoll edge on this direction.
    ///
    /// PARKED moves to READY and wakes the waiters (they attempt the
    /// syscall); UNCERTAIN moves to READY; IN_FLIGHT is demoted to
    /// UNCERTAIN so the fiber inside the syscall cannot conclude the
    /// kernel is drained; READY re-wakes waiters in case a previous edge
    /// was never consumed. CAS failures mean the state moved under us;
    /// retry against the new value.
    fn on_event_with<F>(&self, wake_fd: i32, mut sched: F)
    where
        F: FnMut(*mut Fiber, i32),
    {
        loop {
            match self.state.load(Ordering::Acquire) {
                PARKED => {
                    if self
                        .state
                        .compare_exchange(PARKED, READY, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.schedule_waiters_with(wake_fd, &mut sched);
                        return;
                    }
                }
                UNCERTAIN => {
                    if self
                        .state
                        .compare_exchange(UNCERTAIN, READY, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                IN_FLIGHT => {
                    if self
                        .state
                        .compare_exchange(IN_FLIGHT, UNCERTAIN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // The in-flight fiber just concluded "drained" and
                    // parked the state. Preserve the edge.
                    if self
                        .state
                        .compare_exchange(PARKED, UNCERTAIN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.schedule_waiters_with(wake_fd, &mut sched);
                        return;
                    }
                }
                _ => {
                    // READY: a previous edge is still unconsumed; waking
                    // the waiters again is idempotent.
                    self.schedule_waiters_with(wake_fd, &mut sched);
                    return;
                }
            }
        }
    }

    /// Event-loop transition wired to the scheduler.
    pub fn on_event(&self, rt: &RuntimeInner, wake_fd: i32) {
        self.on_event_with(wake_fd, |fiber, wfd| rt.schedule(fiber, wfd));
    }
}

/// One descriptor table entry.
pub struct FdEntry {
    pub lifecycle: AtomicU32,
    pub reader: DirSide,
    pub writer: DirSide,
}

impl FdEntry {
    #[inline]
    pub fn lifecycle(&self) -> FdLifecycle {
        FdLifecycle::from(self.lifecycle.load(Ordering::Acquire))
    }

    /// Reset both machines to their initial shape: reader EMPTY (nothing
    /// to read), writer READY (buffer presumed writable). Used while
    /// INITIALIZING and on close.
    pub fn reset_states(&self) {
        self.reader.state.store(PARKED, Ordering::Release);
        self.writer.state.store(READY, Ordering::Release);
    }
}

/// Process-wide descriptor table, indexed by fd.
pub struct FdTable {
    base: *mut FdEntry,
    capacity: usize,
}

unsafe impl Send for FdTable {}
unsafe impl Sync for FdTable {}

impl FdTable {
    /// Allocate one entry per descriptor the process may hold. The
    /// zero-filled mapping reads as NOT_INITED everywhere; pages are
    /// faulted in lazily as descriptors are touched.
    pub fn new() -> strand_core::RuntimeResult<Self> {
        let capacity = nofile_limit();
        let bytes = capacity * std::mem::size_of::<FdEntry>();

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(strand_core::RuntimeError::Setup("mmap(fd table)", sys::errno()));
        }

        Ok(Self {
            base: base as *mut FdEntry,
            capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entry for `fd`, or None when the descriptor falls outside the
    /// table (negative, or the limit was raised after startup).
    #[inline]
    pub fn get(&self, fd: i32) -> Option<&FdEntry> {
        if fd < 0 || fd as usize >= self.capacity {
            return None;
        }
        Some(unsafe { &*self.base.add(fd as usize) })
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(
                    self.base as *mut libc::c_void,
                    self.capacity * std::mem::size_of::<FdEntry>(),
                );
            }
        }
    }
}

/// Soft RLIMIT_NOFILE, the table size.
fn nofile_limit() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if ret != 0 || rl.rlim_cur == 0 {
        1024
    } else {
        rl.rlim_cur as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(state: u32) -> DirSide {
        DirSide {
            state: AtomicU32::new(state),
            waiters: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn collect_scheduled(side: &DirSide, wake_fd: i32) -> Vec<(*mut Fiber, i32)> {
        let mut out = Vec::new();
        side.on_event_with(wake_fd, |f, w| out.push((f, w)));
        out
    }

    #[test]
    fn test_event_on_parked_promotes_and_wakes() {
        let s = side(PARKED);
        let fiber = 0x1000 as *mut Fiber;
        let mut node = WaitNode::new(fiber);
        assert!(s.enqueue(&mut node));

        let woken = collect_scheduled(&s, 7);
        assert_eq!(s.state.load(Ordering::Relaxed), READY);
        assert_eq!(woken, vec![(fiber, 7)]);
        assert!(s.steal_waiters().is_null());
    }

    #[test]
    fn test_event_on_uncertain_promotes_quietly() {
        let s = side(UNCERTAIN);
        let woken = collect_scheduled(&s, 7);
        assert_eq!(s.state.load(Ordering::Relaxed), READY);
        assert!(woken.is_empty());
    }

    #[test]
    fn test_event_on_in_flight_demotes() {
        let s = side(IN_FLIGHT);
        let woken = collect_scheduled(&s, 7);
        assert_eq!(s.state.load(Ordering::Relaxed), UNCERTAIN);
        assert!(woken.is_empty());
    }

    #[test]
    fn test_event_on_ready_rewakes() {
        let s = side(READY);
        let fiber = 0x2000 as *mut Fiber;
        let mut node = WaitNode::new(fiber);
        assert!(s.enqueue(&mut node));

        let woken = collect_scheduled(&s, 9);
        assert_eq!(s.state.load(Ordering::Relaxed), READY);
        assert_eq!(woken, vec![(fiber, 9)]);
    }

    #[test]
    fn test_wait_list_is_lifo_and_steals_fibers_once() {
        let s = side(PARKED);
        let f1 = 0x10 as *mut Fiber;
        let f2 = 0x20 as *mut Fiber;
        let mut n1 = WaitNode::new(f1);
        let mut n2 = WaitNode::new(f2);
        assert!(s.enqueue(&mut n1));
        assert!(s.enqueue(&mut n2));

        let mut seen = Vec::new();
        s.schedule_waiters_with(5, |f, _| seen.push(f));
        assert_eq!(seen, vec![f2, f1]);

        // Fiber pointers were stolen; a second pass over the same nodes
        // would find nothing, and the list head is already empty.
        assert!(n1.fiber.load(Ordering::Relaxed).is_null());
        assert!(n2.fiber.load(Ordering::Relaxed).is_null());
        let mut again = Vec::new();
        s.schedule_waiters_with(5, |f, _| again.push(f));
        assert!(again.is_empty());
    }

    #[test]
    fn test_enqueue_detects_race() {
        let s = side(PARKED);
        let mut n1 = WaitNode::new(0x10 as *mut Fiber);
        assert!(s.enqueue(&mut n1));
        // A node prepared against a stale head loses the CAS.
        let mut n2 = WaitNode::new(0x20 as *mut Fiber);
        n2.next.store(std::ptr::null_mut(), Ordering::Relaxed);
        let stale_head = std::ptr::null_mut();
        let won = s
            .waiters
            .compare_exchange(stale_head, &mut n2, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(!won);
    }

    #[test]
    fn test_reset_states() {
        let entry = FdEntry {
            lifecycle: AtomicU32::new(FdLifecycle::NonBlocking as u32),
            reader: side(READY),
            writer: side(IN_FLIGHT),
        };
        entry.reset_states();
        assert_eq!(entry.reader.state.load(Ordering::Relaxed), PARKED);
        assert_eq!(entry.writer.state.load(Ordering::Relaxed), READY);
    }

    #[test]
    fn test_table_bounds() {
        let table = FdTable::new().unwrap();
        assert!(table.capacity() > 0);
        assert!(table.get(-1).is_none());
        assert!(table.get(table.capacity() as i32).is_none());
        let entry = table.get(0).unwrap();
        assert_eq!(entry.lifecycle(), FdLifecycle::NotInited);
    }
}
