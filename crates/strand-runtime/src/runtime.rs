//! Runtime context: global singletons, spawn, start/stop
//!
//! One `RuntimeInner` per process, created lazily on first use and held
//! in a `OnceLock`. `start_loop` brings up the worker, reactor, and
//! offload threads; shutdown is driven by the live-fiber count reaching
//! zero, which fires the terminate event through the event loop and
//! drains every worker.

use crate::arch;
use crate::config::RuntimeConfig;
use crate::fdtable::FdTable;
use crate::fiber::{self, Fiber};
use crate::offload::OffloadPool;
use crate::reactor;
use crate::signal;
use crate::sys;
use crate::tls;
use crate::wake::Event;
use crate::worker::{worker_main, Worker};
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use strand_core::error::{RuntimeError, RuntimeResult};
use strand_core::finfo;
use strand_core::state::FiberState;

/// Process-wide runtime state.
pub struct RuntimeInner {
    pub config: RuntimeConfig,
    pub table: FdTable,
    pub workers: Box<[Worker]>,
    /// Spawned minus terminated fibers.
    pub alive: AtomicUsize,
    /// Shuts the event loop down once `alive` reaches zero.
    pub terminate: Event,
    pub epoll_fd: RawFd,
    pub signal_fd: RawFd,
    pub offload: OffloadPool,
    started: AtomicBool,
    reactor_thread: Mutex<Option<JoinHandle<()>>>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RuntimeInner {
    fn build(config: RuntimeConfig) -> RuntimeResult<Self> {
        strand_core::fprint::init();

        let table = FdTable::new()?;

        let num_workers = config.num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            workers.push(Worker::new(i)?);
        }

        let terminate = Event::new()?;

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(RuntimeError::Setup("epoll_create1", sys::errno()));
        }

        let signal_fd = signal::setup()?;

        // The terminate event and the signalfd are the two non-table fds
        // the event loop demultiplexes by value.
        epoll_add(epoll_fd, terminate.fd(), libc::EPOLLIN as u32)?;
        epoll_add(epoll_fd, signal_fd, libc::EPOLLIN as u32)?;

        let offload = OffloadPool::new(config.offload_queue_capacity)?;

        Ok(Self {
            config,
            table,
            workers: workers.into_boxed_slice(),
            alive: AtomicUsize::new(0),
            terminate,
            epoll_fd,
            signal_fd,
            offload,
            started: AtomicBool::new(false),
            reactor_thread: Mutex::new(None),
            worker_threads: Mutex::new(Vec::new()),
        })
    }

    /// Record a wake and push the fiber onto its owner worker's queue.
    ///
    /// Idempotent per fiber: the `queued` flag admits exactly one queue
    /// entry at a time, so racing wakers (several wait lists, the signal
    /// bridge, the offload pool) cannot double-queue. A later waker only
    /// refreshes `wake_fd`.
    pub(crate) fn schedule(&self, fiber: *mut Fiber, wake_fd: i32) {
        let f = unsafe { &*fiber };
        f.wake_fd.store(wake_fd, Ordering::Release);
        if !f.queued.swap(true, Ordering::AcqRel) {
            let worker = &self.workers[f.worker as usize];
            worker.queue.push(fiber);
            worker.event.trigger();
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        unsafe {
            if self.epoll_fd >= 0 {
                sys::close(self.epoll_fd);
            }
            if self.signal_fd >= 0 {
                sys::close(self.signal_fd);
            }
        }
    }
}

fn epoll_add(epoll_fd: RawFd, fd: RawFd, events: u32) -> RuntimeResult<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if ret != 0 {
        return Err(RuntimeError::Setup("epoll_ctl(ADD)", sys::errno()));
    }
    Ok(())
}

static RUNTIME: OnceLock<RuntimeInner> = OnceLock::new();

/// The runtime, if it has been created.
#[inline]
pub fn try_get() -> Option<&'static RuntimeInner> {
    RUNTIME.get()
}

/// The runtime, created with `config` on first call. A concurrent loser
/// of the creation race drops its duplicate and uses the winner.
pub fn init_with(config: RuntimeConfig) -> RuntimeResult<&'static RuntimeInner> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let built = RuntimeInner::build(config)?;
    let _ = RUNTIME.set(built);
    Ok(RUNTIME.get().expect("runtime slot just filled"))
}

fn obtain() -> &'static RuntimeInner {
    match init_with(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => panic!("strand: runtime initialization failed: {}", e),
    }
}

thread_local! {
    /// Per-thread LCG state for spawn's two-choice sampling.
    static SPAWN_RNG: Cell<usize> = const { Cell::new(0) };
}

fn next_random() -> usize {
    SPAWN_RNG.with(|cell| {
        let mut s = cell.get();
        if s == 0 {
            // Seed from the slot's address; distinct per thread.
            s = (cell as *const _ as usize).wrapping_mul(2654435761) | 1;
        }
        s = s.wrapping_mul(1103515245).wrapping_add(12345);
        cell.set(s);
        s >> 16
    })
}

/// Pick the owner worker for a new fiber: sample two distinct workers
/// uniformly and take the one with fewer assigned fibers.
fn pick_worker(rt: &RuntimeInner) -> usize {
    let n = rt.workers.len();
    if n == 1 {
        return 0;
    }
    let a = next_random() % n;
    let mut b = next_random() % (n - 1);
    if b >= a {
        b += 1;
    }
    let load_a = rt.workers[a].assigned.load(Ordering::Relaxed);
    let load_b = rt.workers[b].assigned.load(Ordering::Relaxed);
    if load_a <= load_b {
        a
    } else {
        b
    }
}

/// Spawn a fiber.
///
/// The fiber is permanently bound to the chosen worker. Spawn the first
/// fiber before `start_loop`: workers run while the live count is
/// non-zero, so a pool started empty shuts straight down.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let rt = obtain();
    let worker = pick_worker(rt);
    rt.workers[worker].assigned.fetch_add(1, Ordering::Relaxed);
    rt.alive.fetch_add(1, Ordering::AcqRel);

    let fiber = Fiber::new(worker as u32, rt.config.stack_size, Box::new(f))
        .expect("strand: fiber stack allocation failed");
    let ptr = Box::into_raw(fiber);

    unsafe {
        (*ptr).queued.store(true, Ordering::Release);
    }
    rt.workers[worker].queue.push(ptr);
    rt.workers[worker].event.trigger();
}

/// Yield the current fiber back to its worker, staying runnable.
///
/// On a non-fiber thread this yields the OS thread.
pub fn yield_now() {
    let fiber = tls::current_fiber();
    if fiber.is_null() {
        std::thread::yield_now();
        return;
    }
    let rt = obtain();
    let f = unsafe { &*fiber };
    f.set_state(FiberState::Runnable);
    if !f.queued.swap(true, Ordering::AcqRel) {
        // No event trigger needed: this worker drains again before it
        // can sleep, and the push lands before the switch below.
        rt.workers[f.worker as usize].queue.push(fiber);
    }
    unsafe {
        arch::context_switch(f.regs.get(), tls::sched_ctx());
    }
}

/// Opaque handle of the calling fiber, suitable for
/// `sigev_value.sival_ptr` in AIO submissions. Zero outside a fiber.
pub fn current_handle() -> u64 {
    tls::current_fiber() as u64
}

/// Park the calling fiber until its handle is scheduled (AIO completion
/// signal, or any other external waker). Returns the recorded wake fd.
/// No-op returning -1 on a non-fiber thread.
pub fn park_current() -> i32 {
    if !tls::in_fiber() {
        return -1;
    }
    fiber::park_current()
}

/// Start the runtime threads with the environment configuration.
pub fn start_loop() -> RuntimeResult<()> {
    start_loop_with(RuntimeConfig::from_env())
}

/// Start the runtime threads: N pinned workers, one event-loop thread,
/// and the blocking-offload pool. Call once.
pub fn start_loop_with(config: RuntimeConfig) -> RuntimeResult<()> {
    let rt = init_with(config)?;
    if rt.started.swap(true, Ordering::SeqCst) {
        return Err(RuntimeError::AlreadyStarted);
    }

    rt.offload.start(rt);

    {
        let mut guard = rt.worker_threads.lock().unwrap();
        for i in 0..rt.workers.len() {
            let handle = std::thread::Builder::new()
                .name(format!("strand-worker-{}", i))
                .spawn(move || worker_main(rt, i))
                .map_err(|e| {
                    RuntimeError::Setup("spawn(worker)", e.raw_os_error().unwrap_or(0))
                })?;
            guard.push(handle);
        }
    }

    let reactor = std::thread::Builder::new()
        .name("strand-reactor".into())
        .spawn(move || reactor::reactor_loop(rt))
        .map_err(|e| RuntimeError::Setup("spawn(reactor)", e.raw_os_error().unwrap_or(0)))?;
    *rt.reactor_thread.lock().unwrap() = Some(reactor);

    finfo!(
        "runtime started: {} workers, {} offload threads, fd table {}",
        rt.workers.len(),
        rt.config.offload_workers,
        rt.table.capacity()
    );
    Ok(())
}

/// Join the event-loop thread (and with it the workers and the offload
/// pool). Returns once every fiber has terminated.
pub fn stop_loop() -> RuntimeResult<()> {
    let rt = try_get().ok_or(RuntimeError::NotStarted)?;
    if !rt.started.load(Ordering::Acquire) {
        return Err(RuntimeError::NotStarted);
    }

    if let Some(handle) = rt.reactor_thread.lock().unwrap().take() {
        let _ = handle.join();
    }
    for handle in rt.worker_threads.lock().unwrap().drain(..) {
        let _ = handle.join();
    }
    rt.offload.shutdown();

    finfo!("runtime stopped");
    Ok(())
}
