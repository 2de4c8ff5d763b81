//! Fibers: stackful cooperative tasks
//!
//! A fiber is heap-allocated and referenced by raw pointer from exactly
//! one place at a time: the worker running it, its owner's run queue, or
//! a wait list (through a `WaitNode`). The `queued` flag makes run-queue
//! pushes idempotent, so racing wakers cannot double-queue a fiber.

use crate::arch::{self, SavedRegs};
use crate::stack::FiberStack;
use crate::tls;
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, Ordering};
use strand_core::ferror;
use strand_core::error::RuntimeResult;
use strand_core::state::FiberState;

/// Boxed fiber entry.
pub type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// A suspendable execution with its own stack.
pub struct Fiber {
    /// Runnable / Running / Waiting / Terminated.
    pub state: AtomicU8,

    /// True while the fiber sits in (or is being pushed to) its run
    /// queue. Consumers clear it before resuming.
    pub queued: AtomicBool,

    /// Owning worker index, assigned at spawn, immutable.
    pub worker: u32,

    /// Written by whoever wakes the fiber: the fd that became ready, the
    /// timer fd on a poll timeout, or -1 when no descriptor applies.
    pub wake_fd: AtomicI32,

    /// Intrusive link for the owner worker's run queue.
    pub run_next: AtomicPtr<Fiber>,

    /// Saved registers while suspended.
    pub regs: UnsafeCell<SavedRegs>,

    /// Entry closure, taken exactly once on first resume.
    entry: UnsafeCell<Option<EntryFn>>,

    /// Owned guarded stack. Dropped with the fiber.
    stack: FiberStack,
}

// All cross-thread access goes through the atomics; regs and entry are
// touched only by the owning worker while the fiber is not running.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Allocate a fiber bound to `worker` and seed its context so the
    /// first resume enters `fiber_entry`.
    pub fn new(worker: u32, stack_size: usize, entry: EntryFn) -> RuntimeResult<Box<Fiber>> {
        let stack = FiberStack::new(stack_size)?;
        let fiber = Box::new(Fiber {
            state: AtomicU8::new(FiberState::Runnable as u8),
            queued: AtomicBool::new(false),
            worker,
            wake_fd: AtomicI32::new(-1),
            run_next: AtomicPtr::new(std::ptr::null_mut()),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            entry: UnsafeCell::new(Some(entry)),
            stack,
        });

        let arg = &*fiber as *const Fiber as usize;
        unsafe {
            arch::init_context(
                fiber.regs.get(),
                fiber.stack.top(),
                fiber_entry as usize,
                arg,
            );
        }
        Ok(fiber)
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

/// First frame of every fiber. Runs the user closure under a panic
/// guard; a panic is logged and the fiber terminates normally.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = arg as *mut Fiber;
    let entry = unsafe { (*(*fiber).entry.get()).take() };

    if let Some(f) = entry {
        if let Err(cause) = catch_unwind(AssertUnwindSafe(f)) {
            let msg = cause
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| cause.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("non-string panic payload");
            ferror!("fiber terminated by panic: {}", msg);
        }
    }
    // Returns into the trampoline, which calls fiber_finished.
}

/// Called by the entry trampoline after `fiber_entry` returns. Marks the
/// fiber terminated and switches back to the worker, which reclaims it.
pub(crate) extern "C" fn fiber_finished() {
    let fiber = tls::current_fiber();
    debug_assert!(!fiber.is_null());
    unsafe {
        (*fiber).set_state(FiberState::Terminated);
        arch::context_switch((*fiber).regs.get(), tls::sched_ctx());
    }
    unreachable!("terminated fiber resumed");
}

/// Suspend the current fiber until something schedules it. Returns the
/// `wake_fd` the waker recorded.
///
/// The caller must already be published on a wait list (or otherwise
/// discoverable by a waker), or it will never run again.
pub(crate) fn park_current() -> i32 {
    let fiber = tls::current_fiber();
    debug_assert!(!fiber.is_null(), "park_current outside a fiber");
    unsafe {
        (*fiber).set_state(FiberState::Waiting);
        arch::context_switch((*fiber).regs.get(), tls::sched_ctx());
        (*fiber).wake_fd.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_allocation() {
        let fiber = Fiber::new(3, 64 * 1024, Box::new(|| {})).unwrap();
        assert_eq!(fiber.worker, 3);
        assert_eq!(fiber.state(), FiberState::Runnable);
        assert!(!fiber.queued.load(Ordering::Relaxed));
        assert_eq!(fiber.wake_fd.load(Ordering::Relaxed), -1);
    }

    #[test]
    fn test_context_seeded() {
        let fiber = Fiber::new(0, 64 * 1024, Box::new(|| {})).unwrap();
        let regs = unsafe { &*fiber.regs.get() };
        assert_ne!(regs.rip, 0);
        assert_ne!(regs.rsp, 0);
        assert_eq!(regs.rsp % 16, 0);
    }
}
