//! Thread-local storage for worker and fiber context
//!
//! Fast access to the current worker index, the current fiber, and the
//! worker's scheduler context (the save area a yielding fiber switches
//! back into). A null current fiber marks a non-fiber thread and forces
//! the interceptors into pass-through.

use crate::arch::SavedRegs;
use crate::fiber::Fiber;
use std::cell::Cell;

thread_local! {
    /// Worker index for this OS thread; usize::MAX off the worker pool.
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };

    /// Fiber currently executing on this thread, if any.
    static CURRENT_FIBER: Cell<*mut Fiber> = const { Cell::new(std::ptr::null_mut()) };

    /// The worker's scheduler context save area.
    static SCHED_CTX: Cell<*mut SavedRegs> = const { Cell::new(std::ptr::null_mut()) };
}

#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|cell| cell.get())
}

#[inline]
pub fn set_current_fiber(fiber: *mut Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(fiber));
}

#[inline]
pub fn clear_current_fiber() {
    CURRENT_FIBER.with(|cell| cell.set(std::ptr::null_mut()));
}

#[inline]
pub fn current_fiber() -> *mut Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

/// Check whether this thread is currently running a fiber.
#[inline]
pub fn in_fiber() -> bool {
    !current_fiber().is_null()
}

#[inline]
pub fn set_sched_ctx(ctx: *mut SavedRegs) {
    SCHED_CTX.with(|cell| cell.set(ctx));
}

#[inline]
pub fn sched_ctx() -> *mut SavedRegs {
    SCHED_CTX.with(|cell| cell.get())
}
