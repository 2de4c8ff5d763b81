//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// `start_loop` was called twice
    AlreadyStarted,

    /// Operation requires a started runtime
    NotStarted,

    /// A startup syscall failed. Carries the call name and errno.
    Setup(&'static str, i32),

    /// OS error with errno
    Os(i32),

    /// The offload queue is full and stayed full
    OffloadSaturated,

    /// Descriptor outside the table (fd >= RLIMIT_NOFILE at startup)
    BadDescriptor(i32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AlreadyStarted => write!(f, "runtime already started"),
            RuntimeError::NotStarted => write!(f, "runtime not started"),
            RuntimeError::Setup(what, errno) => {
                write!(f, "startup failure in {}: errno {}", what, errno)
            }
            RuntimeError::Os(errno) => write!(f, "OS error: errno {}", errno),
            RuntimeError::OffloadSaturated => write!(f, "offload queue saturated"),
            RuntimeError::BadDescriptor(fd) => write!(f, "descriptor {} outside table", fd),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::Setup("epoll_create1", 24);
        assert_eq!(format!("{}", e), "startup failure in epoll_create1: errno 24");

        let e = RuntimeError::Os(9);
        assert_eq!(format!("{}", e), "OS error: errno 9");
    }
}
