//! # strand-core
//!
//! Core types for the strand fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All Linux plumbing (epoll, eventfd, fibers, interception) lives in
//! `strand-runtime`.
//!
//! ## Modules
//!
//! - `state` - descriptor readiness states, descriptor lifecycle, fiber state
//! - `error` - error types
//! - `fprint` - fiber-runtime debug print macros

pub mod error;
pub mod fprint;
pub mod state;

// Re-exports for convenience
pub use error::{RuntimeError, RuntimeResult};
pub use state::{FdLifecycle, FiberState, ReadState, WriteState};
