//! Runtime-internal print macros
//!
//! Thread-safe, optionally-flushing stderr output for the runtime itself.
//! The interception layer must never log through buffered stdio on the
//! fiber path, so everything here writes straight to stderr.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `STRAND_FLUSH_LOG=1` - flush stderr after each print
//!
//! # Usage
//!
//! ```ignore
//! use strand_core::{finfo, fwarn, ferror};
//!
//! finfo!("worker {} started", id);
//! fwarn!("unexpected state {:?}", state);
//! ferror!("fiber panicked: {}", msg);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables.
///
/// Called automatically on first log; callable explicitly for
/// deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("STRAND_FLUSH_LOG") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("STRAND_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Current log level.
#[inline]
pub fn log_level() -> u8 {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LOG_LEVEL.load(Ordering::Relaxed)
}

/// Set the log level programmatically.
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Emit one formatted line. Used by the macros, not called directly.
pub fn emit(level: LogLevel, args: core::fmt::Arguments<'_>) {
    let mut err = std::io::stderr().lock();
    let prefix = level.prefix();
    let _ = if prefix.is_empty() {
        writeln!(err, "{}", args)
    } else {
        writeln!(err, "{} {}", prefix, args)
    };
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = err.flush();
    }
}

/// Unconditional runtime print (no level gate).
#[macro_export]
macro_rules! fprintln {
    ($($arg:tt)*) => {
        $crate::fprint::emit($crate::fprint::LogLevel::Off, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {
        if $crate::fprint::log_level() >= $crate::fprint::LogLevel::Error as u8 {
            $crate::fprint::emit($crate::fprint::LogLevel::Error, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {
        if $crate::fprint::log_level() >= $crate::fprint::LogLevel::Warn as u8 {
            $crate::fprint::emit($crate::fprint::LogLevel::Warn, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {
        if $crate::fprint::log_level() >= $crate::fprint::LogLevel::Info as u8 {
            $crate::fprint::emit($crate::fprint::LogLevel::Info, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {
        if $crate::fprint::log_level() >= $crate::fprint::LogLevel::Debug as u8 {
            $crate::fprint::emit($crate::fprint::LogLevel::Debug, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {
        if $crate::fprint::log_level() >= $crate::fprint::LogLevel::Trace as u8 {
            $crate::fprint::emit($crate::fprint::LogLevel::Trace, format_args!($($arg)*));
        }
    };
}
