//! Descriptor and fiber state types
//!
//! Each descriptor carries two independent readiness machines, one per
//! direction. The numeric values are aligned across directions so the
//! transition engine in `strand-runtime` can treat them uniformly:
//!
//! ```text
//! 0 = parked     (reader EMPTY   / writer FULL)
//! 1 = uncertain  (kernel depth unknown, next syscall probes)
//! 2 = in flight  (reader READING / writer WRITING)
//! 3 = ready      (an epoll edge was observed and not yet consumed)
//! ```

use core::fmt;

/// Reader-side readiness state of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReadState {
    /// The runtime believes the kernel has nothing; parking is correct.
    Empty = 0,

    /// A syscall returned a partial result or an edge arrived mid-syscall;
    /// the next syscall probes.
    Uncertain = 1,

    /// At least one fiber is currently inside the syscall.
    Reading = 2,

    /// An EPOLLIN edge was observed and no reader has consumed it yet.
    Ready = 3,
}

/// Writer-side readiness state of a descriptor.
///
/// Mirrors [`ReadState`]: `Full` is the parked state (no buffer space),
/// `Ready` means the kernel can accept bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WriteState {
    /// Kernel buffer is full; parking is correct.
    Full = 0,

    /// Buffer space unknown; the next syscall probes.
    Uncertain = 1,

    /// At least one fiber is currently inside the syscall.
    Writing = 2,

    /// An EPOLLOUT edge was observed and not yet consumed.
    Ready = 3,
}

impl From<u32> for ReadState {
    fn from(v: u32) -> Self {
        match v {
            0 => ReadState::Empty,
            1 => ReadState::Uncertain,
            2 => ReadState::Reading,
            _ => ReadState::Ready,
        }
    }
}

impl From<u32> for WriteState {
    fn from(v: u32) -> Self {
        match v {
            0 => WriteState::Full,
            1 => WriteState::Uncertain,
            2 => WriteState::Writing,
            _ => WriteState::Ready,
        }
    }
}

/// Lifecycle of a descriptor table entry.
///
/// Advances monotonically `NotInited -> Initializing -> {NonBlocking,
/// ThreadPool}` and resets to `NotInited` only on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FdLifecycle {
    /// Never seen by the interceptor (the zero-initialized table value).
    NotInited = 0,

    /// One interceptor call is registering the fd; others spin.
    Initializing = 1,

    /// Registered with the epoll set in edge-triggered mode.
    NonBlocking = 2,

    /// Not pollable (regular file, block device); syscalls are offloaded.
    ThreadPool = 3,
}

impl From<u32> for FdLifecycle {
    fn from(v: u32) -> Self {
        match v {
            0 => FdLifecycle::NotInited,
            1 => FdLifecycle::Initializing,
            2 => FdLifecycle::NonBlocking,
            _ => FdLifecycle::ThreadPool,
        }
    }
}

impl fmt::Display for FdLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdLifecycle::NotInited => write!(f, "not-inited"),
            FdLifecycle::Initializing => write!(f, "initializing"),
            FdLifecycle::NonBlocking => write!(f, "nonblocking"),
            FdLifecycle::ThreadPool => write!(f, "threadpool"),
        }
    }
}

/// State of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// In a run queue (or about to be), waiting for its worker.
    Runnable = 0,

    /// Currently executing on its worker.
    Running = 1,

    /// Parked on a wait list until an event schedules it.
    Waiting = 2,

    /// Returned (or panicked) out of its entry; awaiting cleanup.
    Terminated = 3,
}

impl FiberState {
    /// Check whether the fiber has finished execution.
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Terminated)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Runnable,
            1 => FiberState::Running,
            2 => FiberState::Waiting,
            _ => FiberState::Terminated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_values_align() {
        // The transition engine relies on parked/uncertain/in-flight/ready
        // sharing numeric values across directions.
        assert_eq!(ReadState::Empty as u32, WriteState::Full as u32);
        assert_eq!(ReadState::Uncertain as u32, WriteState::Uncertain as u32);
        assert_eq!(ReadState::Reading as u32, WriteState::Writing as u32);
        assert_eq!(ReadState::Ready as u32, WriteState::Ready as u32);
    }

    #[test]
    fn test_state_roundtrip() {
        for v in 0..4u32 {
            assert_eq!(ReadState::from(v) as u32, v);
            assert_eq!(WriteState::from(v) as u32, v);
            assert_eq!(FdLifecycle::from(v) as u32, v);
        }
        for v in 0..4u8 {
            assert_eq!(FiberState::from(v) as u8, v);
        }
    }

    #[test]
    fn test_fiber_terminated() {
        assert!(FiberState::Terminated.is_terminated());
        assert!(!FiberState::Waiting.is_terminated());
    }
}
