//! # strand-runtime
//!
//! Linux implementation of the strand fiber runtime.
//!
//! This crate provides:
//! - Stackful fibers with guarded mmap stacks and assembly context switch
//! - Per-worker run queues gated by eventfds, workers pinned to CPUs
//! - A descriptor table of per-direction readiness machines driven by an
//!   edge-triggered epoll event loop
//! - ABI-compatible interception of the blocking POSIX surface
//! - A signalfd bridge for kernel AIO completion wakes
//! - A thread pool fallback for non-pollable descriptors
//!
//! Linking this crate shadows `read`, `write`, `accept`, `accept4`,
//! `connect`, `sendto`, `recvfrom`, `recv`, `poll`, and `close` with
//! fiber-aware replacements; calls from non-fiber threads pass through
//! unchanged.

#![allow(clippy::missing_safety_doc)]

pub mod arch;
pub mod config;
pub mod fdtable;
pub mod fiber;
pub mod offload;
pub mod poll;
pub mod reactor;
pub mod runtime;
pub mod signal;
pub mod stack;
pub mod syscall;
pub mod sys;
pub mod tls;
pub mod wake;
pub mod worker;

// Re-exports
pub use config::RuntimeConfig;
pub use runtime::{
    current_handle, park_current, spawn, start_loop, start_loop_with, stop_loop, yield_now,
};
pub use signal::WAKE_SIGNAL;

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("strand-runtime requires Linux (epoll, eventfd, timerfd, signalfd)");
    }
}
