//! Worker threads and per-worker run queues
//!
//! Each worker owns one intrusive MPSC run queue (producers: spawners
//! and the event loop; consumer: the worker itself) gated by an eventfd
//! used purely as a "queue non-empty" semaphore. A fiber is bound to its
//! worker at spawn and never migrates, so every resume of a given fiber
//! happens on the same OS thread.

use crate::arch::{self, SavedRegs};
use crate::fiber::Fiber;
use crate::runtime::RuntimeInner;
use crate::tls;
use crate::wake::Event;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use strand_core::{fdebug, fwarn};
use strand_core::state::FiberState;

/// Intrusive MPSC run queue over `Fiber::run_next` links.
///
/// Producers CAS-push at the head; the consumer steals the whole chain
/// and reverses it, so drained batches run in arrival order.
pub struct RunQueue {
    head: AtomicPtr<Fiber>,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Push a fiber. The fiber must not currently be in any queue (the
    /// caller holds the `queued` flag).
    pub fn push(&self, fiber: *mut Fiber) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*fiber).run_next.store(head, Ordering::Relaxed);
            }
            if self
                .head
                .compare_exchange_weak(head, fiber, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Steal everything pushed so far, oldest first. Single consumer.
    pub fn drain(&self) -> DrainList {
        let mut chain = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        // Reverse the LIFO chain into arrival order.
        let mut out: *mut Fiber = std::ptr::null_mut();
        while !chain.is_null() {
            let next = unsafe { (*chain).run_next.load(Ordering::Relaxed) };
            unsafe {
                (*chain).run_next.store(out, Ordering::Relaxed);
            }
            out = chain;
            chain = next;
        }
        DrainList { head: out }
    }
}

/// A drained batch of fibers, consumed front to back.
pub struct DrainList {
    head: *mut Fiber,
}

impl DrainList {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Iterator for DrainList {
    type Item = *mut Fiber;

    fn next(&mut self) -> Option<*mut Fiber> {
        if self.head.is_null() {
            return None;
        }
        let fiber = self.head;
        self.head = unsafe { (*fiber).run_next.load(Ordering::Relaxed) };
        Some(fiber)
    }
}

/// Per-worker state, one slot per worker in the runtime's array.
pub struct Worker {
    /// This worker's index; also its pinned CPU.
    pub index: usize,
    /// Runnable fibers owned by this worker.
    pub queue: RunQueue,
    /// "Queue non-empty" semaphore.
    pub event: Event,
    /// Fibers assigned by spawn; read by the choice-of-two balancer.
    pub assigned: AtomicUsize,
    /// Register save area the worker switches out of when resuming a
    /// fiber, and back into when the fiber yields.
    pub sched_ctx: UnsafeCell<SavedRegs>,
}

unsafe impl Sync for Worker {}

impl Worker {
    pub fn new(index: usize) -> strand_core::RuntimeResult<Self> {
        Ok(Self {
            index,
            queue: RunQueue::new(),
            event: Event::new()?,
            assigned: AtomicUsize::new(0),
            sched_ctx: UnsafeCell::new(SavedRegs::zeroed()),
        })
    }
}

/// Pin the calling thread to one CPU.
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            fwarn!("worker {}: sched_setaffinity failed: errno {}", cpu, crate::sys::errno());
        }
    }
}

/// Main loop of one worker thread.
///
/// Sleeps on the queue event, drains the queue, resumes each fiber.
/// Exits when the live-fiber count reaches zero; the event loop breaks
/// the sleep by triggering every queue event on its way out, and each
/// exiting worker re-triggers the terminate event so its peers follow.
pub fn worker_main(rt: &'static RuntimeInner, index: usize) {
    tls::set_worker_id(index);
    let worker = &rt.workers[index];
    tls::set_sched_ctx(worker.sched_ctx.get());

    if rt.config.pin_workers {
        pin_to_cpu(index % crate::config::logical_cpus());
    }
    fdebug!("worker {} started", index);

    while rt.alive.load(Ordering::Acquire) > 0 {
        worker.event.wait_and_reset();
        loop {
            let batch = worker.queue.drain();
            if batch.is_empty() {
                break;
            }
            for fiber in batch {
                run_fiber(rt, worker, fiber);
            }
        }
    }

    // Cascade shutdown to the event loop and the other workers.
    rt.terminate.trigger();
    fdebug!("worker {} exiting", index);
}

/// Resume one fiber and settle its post-yield state.
fn run_fiber(rt: &RuntimeInner, worker: &Worker, fiber: *mut Fiber) {
    let f = unsafe { &*fiber };

    // Clear the queue membership first: a wake arriving while the fiber
    // runs re-queues it, and the retry loops absorb the spurious resume.
    f.queued.store(false, Ordering::Release);

    if f.state() == FiberState::Terminated {
        // Deferred reclamation of a fiber that terminated with a stale
        // queue entry outstanding.
        drop(unsafe { Box::from_raw(fiber) });
        return;
    }

    f.set_state(FiberState::Running);
    tls::set_current_fiber(fiber);
    unsafe {
        arch::context_switch(worker.sched_ctx.get(), f.regs.get());
    }
    tls::clear_current_fiber();

    match f.state() {
        FiberState::Terminated => {
            let remaining = rt.alive.fetch_sub(1, Ordering::AcqRel) - 1;
            if !f.queued.load(Ordering::Acquire) {
                drop(unsafe { Box::from_raw(fiber) });
            }
            if remaining == 0 {
                rt.terminate.trigger();
            }
        }
        // Waiting: a wait list owns the fiber until an event schedules
        // it. Runnable: the fiber re-queued itself before yielding.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;

    fn test_fiber() -> *mut Fiber {
        Box::into_raw(Fiber::new(0, 16 * 1024, Box::new(|| {})).unwrap())
    }

    #[test]
    fn test_run_queue_fifo_order() {
        let q = RunQueue::new();
        let a = test_fiber();
        let b = test_fiber();
        let c = test_fiber();
        q.push(a);
        q.push(b);
        q.push(c);

        let drained: Vec<_> = q.drain().collect();
        assert_eq!(drained, vec![a, b, c]);
        assert!(q.drain().is_empty());

        for f in drained {
            drop(unsafe { Box::from_raw(f) });
        }
    }

    #[test]
    fn test_run_queue_drain_batches() {
        let q = RunQueue::new();
        let a = test_fiber();
        q.push(a);
        let first: Vec<_> = q.drain().collect();
        assert_eq!(first, vec![a]);

        let b = test_fiber();
        q.push(b);
        let second: Vec<_> = q.drain().collect();
        assert_eq!(second, vec![b]);

        for f in [a, b] {
            drop(unsafe { Box::from_raw(f) });
        }
    }

    #[test]
    fn test_worker_slot() {
        let w = Worker::new(2).unwrap();
        assert_eq!(w.index, 2);
        assert_eq!(w.assigned.load(Ordering::Relaxed), 0);
    }
}
