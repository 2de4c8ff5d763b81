//! Blocking-offload pool for non-pollable descriptors
//!
//! Regular files and block devices reject edge-triggered epoll (EPERM),
//! so their syscalls run on a small pool of plain OS threads instead.
//! The contract: given (syscall number, packed args), perform the call
//! on a non-fiber thread and hand the kernel-style result back to the
//! parked fiber.
//!
//! Requests travel through a bounded lock-free queue; the result lands
//! through a pointer into the parked fiber's frame, which stays alive
//! for exactly the park duration, the same discipline wait-nodes follow.

use crate::fiber::Fiber;
use crate::runtime::{self, RuntimeInner};
use crate::sys;
use crate::tls;
use crate::wake::Event;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use strand_core::error::RuntimeResult;
use strand_core::fdebug;

/// One syscall delegated to the pool.
struct OffloadRequest {
    nr: libc::c_long,
    args: [u64; 6],
    fiber: *mut Fiber,
    /// Slot in the parked fiber's frame; written before the wake.
    result: *mut i64,
}

// The raw pointers reference a fiber that stays parked (and its frame
// live) until the pool schedules it.
unsafe impl Send for OffloadRequest {}

/// Bounded pool executing blocking syscalls on behalf of fibers.
pub struct OffloadPool {
    queue: ArrayQueue<OffloadRequest>,
    event: Event,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl OffloadPool {
    pub fn new(capacity: usize) -> RuntimeResult<Self> {
        Ok(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            event: Event::new()?,
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the pool threads.
    pub fn start(&self, rt: &'static RuntimeInner) {
        let mut guard = self.threads.lock().unwrap();
        for i in 0..rt.config.offload_workers.max(1) {
            let handle = std::thread::Builder::new()
                .name(format!("strand-offload-{}", i))
                .spawn(move || offload_loop(rt))
                .expect("strand: failed to spawn offload thread");
            guard.push(handle);
        }
    }

    /// Execute `nr(args)` on the pool and park until the result arrives.
    ///
    /// Must be called from a fiber. Returns the kernel-style result.
    pub(crate) unsafe fn submit_and_wait(&self, nr: libc::c_long, args: [u64; 6]) -> i64 {
        let fiber = tls::current_fiber();
        debug_assert!(!fiber.is_null(), "offload submit outside a fiber");

        let mut result: i64 = 0;
        let mut req = OffloadRequest {
            nr,
            args,
            fiber,
            result: &mut result,
        };

        // Queue full: yield this fiber and retry; the pool drains
        // independently of our worker.
        loop {
            match self.queue.push(req) {
                Ok(()) => break,
                Err(returned) => {
                    req = returned;
                    runtime::yield_now();
                }
            }
        }
        self.event.trigger();

        runtime::park_current();
        result
    }

    /// Stop and join the pool threads.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut guard = self.threads.lock().unwrap();
        for _ in guard.iter() {
            self.event.trigger();
        }
        for handle in guard.drain(..) {
            let _ = handle.join();
        }
    }
}

fn offload_loop(rt: &'static RuntimeInner) {
    fdebug!("offload thread started");
    loop {
        match rt.offload.queue.pop() {
            Some(req) => unsafe {
                let ret = sys::raw(req.nr, req.args);
                req.result.write(ret);
                rt.schedule(req.fiber, -1);
            },
            None => {
                if rt.offload.shutdown.load(Ordering::Acquire) {
                    break;
                }
                rt.offload.event.wait_and_reset();
            }
        }
    }
    fdebug!("offload thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_capacity_clamped() {
        let pool = OffloadPool::new(0).unwrap();
        assert!(!pool.shutdown.load(Ordering::Relaxed));
        assert_eq!(pool.queue.capacity(), 1);
    }

    #[test]
    fn test_shutdown_without_threads() {
        let pool = OffloadPool::new(4).unwrap();
        pool.shutdown();
        assert!(pool.shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn test_request_roundtrip_through_queue() {
        let pool = OffloadPool::new(2).unwrap();
        let mut result: i64 = 0;
        let req = OffloadRequest {
            nr: libc::SYS_getpid,
            args: [0; 6],
            fiber: std::ptr::null_mut(),
            result: &mut result,
        };
        assert!(pool.queue.push(req).is_ok());
        let popped = pool.queue.pop().unwrap();
        let ret = unsafe { sys::raw(popped.nr, popped.args) };
        assert!(ret > 0);
    }
}
