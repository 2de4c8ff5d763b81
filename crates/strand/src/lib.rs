//! # strand - fibers over blocking POSIX I/O
//!
//! A user-space M:N fiber runtime for Linux. User code spawns
//! lightweight fibers and keeps issuing ordinary `read` / `write` /
//! `accept` / `connect` / `poll` calls; the runtime intercepts each
//! call at the ABI level, drives the descriptor through edge-triggered
//! epoll, and parks only the calling fiber until the kernel reports
//! readiness. Work spreads over one pinned worker thread per CPU plus a
//! single event-loop thread.
//!
//! ## Quick start
//!
//! ```ignore
//! fn main() {
//!     // The first fiber must exist before the loop starts: workers
//!     // run while the live-fiber count is non-zero.
//!     strand::spawn(|| {
//!         let mut buf = [0u8; 4096];
//!         let n = unsafe {
//!             libc::read(0, buf.as_mut_ptr() as *mut _, buf.len())
//!         };
//!         println!("read {} bytes without blocking a thread", n);
//!     });
//!
//!     strand::start_loop().expect("runtime startup");
//!     strand::stop_loop().expect("runtime shutdown");
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       User fibers                        │
//! │          plain read()/write()/accept()/poll()            │
//! └──────────────────────────────────────────────────────────┘
//!                             │ intercepted
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Descriptor table: 2 readiness machines + wait lists    │
//! └──────────────────────────────────────────────────────────┘
//!        ▲  transitions                       │ park/wake
//!        │                                    ▼
//! ┌──────────────┐                   ┌──────────────────┐
//! │  Event loop  │── schedules ─────►│  Workers (1/CPU) │
//! │ (epoll_wait) │                   │  run queues      │
//! └──────────────┘                   └──────────────────┘
//! ```
//!
//! Shutdown is driven by the live-fiber count: when the last fiber
//! terminates, the event loop drains every worker and `stop_loop`
//! returns.

// Re-export core types
pub use strand_core::error::{RuntimeError, RuntimeResult};
pub use strand_core::fprint::{set_log_level, LogLevel};
pub use strand_core::state::{FdLifecycle, FiberState, ReadState, WriteState};
pub use strand_core::{fdebug, ferror, finfo, fprintln, ftrace, fwarn};

// Re-export the runtime surface
pub use strand_runtime::{
    current_handle, park_current, spawn, start_loop, start_loop_with, stop_loop, yield_now,
    RuntimeConfig, WAKE_SIGNAL,
};

/// Runtime handle tying startup and shutdown to a scope.
///
/// Thin convenience over [`start_loop`] / [`stop_loop`] for binaries;
/// tests and long-running servers usually call the free functions.
pub struct Runtime {
    stopped: bool,
}

impl Runtime {
    /// Start the runtime threads with the environment configuration.
    ///
    /// Spawn the first fiber before calling this.
    pub fn start() -> RuntimeResult<Self> {
        start_loop()?;
        Ok(Self { stopped: false })
    }

    /// Start with an explicit configuration.
    pub fn start_with(config: RuntimeConfig) -> RuntimeResult<Self> {
        start_loop_with(config)?;
        Ok(Self { stopped: false })
    }

    /// Block until every fiber has terminated and the runtime threads
    /// have been joined.
    pub fn join(mut self) -> RuntimeResult<()> {
        self.stopped = true;
        stop_loop()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = stop_loop();
        }
    }
}
