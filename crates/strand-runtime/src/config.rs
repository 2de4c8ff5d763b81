//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, applied in
//! `from_env`. Unset or unparseable variables fall back to the default;
//! there is no error path for configuration.
//!
//! Environment variables (all optional):
//! - `STRAND_NUM_WORKERS` - worker thread count (default: logical CPUs)
//! - `STRAND_OFFLOAD_WORKERS` - blocking-offload pool size
//! - `STRAND_STACK_SIZE` - usable fiber stack bytes
//! - `STRAND_PIN_WORKERS` - pin worker i to CPU i (on unless 0/false/no/off)
//! - `STRAND_OFFLOAD_QUEUE_CAPACITY` - offload request queue slots

/// Events fetched per `epoll_wait` in the event loop.
pub const EPOLL_BATCH: usize = 500;

const DEFAULT_OFFLOAD_WORKERS: usize = 4;
const DEFAULT_STACK_SIZE: usize = 256 * 1024;
const DEFAULT_OFFLOAD_QUEUE_CAPACITY: usize = 1024;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads; worker i is pinned to CPU i when pinning is on.
    pub num_workers: usize,
    /// Threads in the blocking-offload pool.
    pub offload_workers: usize,
    /// Usable stack bytes per fiber (guard page not included).
    pub stack_size: usize,
    /// Pin workers to CPUs via sched_setaffinity.
    pub pin_workers: bool,
    /// Capacity of the offload request queue.
    pub offload_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, before any environment override.
    fn base() -> Self {
        Self {
            num_workers: logical_cpus(),
            offload_workers: DEFAULT_OFFLOAD_WORKERS,
            stack_size: DEFAULT_STACK_SIZE,
            pin_workers: true,
            offload_queue_capacity: DEFAULT_OFFLOAD_QUEUE_CAPACITY,
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::base();
        for (key, value) in std::env::vars() {
            match key.as_str() {
                "STRAND_NUM_WORKERS" => {
                    if let Ok(n) = value.parse() {
                        config.num_workers = n;
                    }
                }
                "STRAND_OFFLOAD_WORKERS" => {
                    if let Ok(n) = value.parse() {
                        config.offload_workers = n;
                    }
                }
                "STRAND_STACK_SIZE" => {
                    if let Ok(n) = value.parse() {
                        config.stack_size = n;
                    }
                }
                "STRAND_PIN_WORKERS" => {
                    config.pin_workers =
                        !matches!(value.to_lowercase().as_str(), "0" | "false" | "no" | "off");
                }
                "STRAND_OFFLOAD_QUEUE_CAPACITY" => {
                    if let Ok(n) = value.parse() {
                        config.offload_queue_capacity = n;
                    }
                }
                _ => {}
            }
        }
        config
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }
}

/// Logical CPU count, at least 1.
pub fn logical_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::base();
        assert!(config.num_workers >= 1);
        assert!(config.stack_size >= 4096);
        assert!(config.offload_queue_capacity > 0);
        assert!(config.pin_workers);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("STRAND_STACK_SIZE", "131072");
        std::env::set_var("STRAND_PIN_WORKERS", "off");
        std::env::set_var("STRAND_OFFLOAD_WORKERS", "not-a-number");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.stack_size, 131072);
        assert!(!config.pin_workers);
        // Garbage values keep the default.
        assert_eq!(config.offload_workers, DEFAULT_OFFLOAD_WORKERS);

        std::env::remove_var("STRAND_STACK_SIZE");
        std::env::remove_var("STRAND_PIN_WORKERS");
        std::env::remove_var("STRAND_OFFLOAD_WORKERS");
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::base().num_workers(2).pin_workers(false);
        assert_eq!(config.num_workers, 2);
        assert!(!config.pin_workers);
    }

    #[test]
    fn test_logical_cpus_positive() {
        assert!(logical_cpus() >= 1);
    }
}
