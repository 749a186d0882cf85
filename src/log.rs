//! Minimal stderr logger, filtered by the `RD_LOG` environment variable.
//!
//! Mirrors the logging style the rest of the tree calls into (`log!`,
//! `ed_assert!`): terse, level-tagged lines to stderr, no dependency on an
//! external logging framework because the core only ever needs "print this
//! if the operator asked for this level".

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
#[repr(usize)]
pub enum LogLevel {
    LogFatal = 0,
    LogError = 1,
    LogWarn = 2,
    LogInfo = 3,
    LogDebug = 4,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::LogFatal => "FATAL",
            LogLevel::LogError => "ERROR",
            LogLevel::LogWarn => "WARN",
            LogLevel::LogInfo => "INFO",
            LogLevel::LogDebug => "DEBUG",
        }
    }
}

static LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::LogInfo as usize);
static INIT: Once = Once::new();

fn init_from_env() {
    INIT.call_once(|| {
        if let Ok(val) = env::var("RD_LOG") {
            let parsed = match val.to_ascii_lowercase().as_str() {
                "fatal" => Some(LogLevel::LogFatal),
                "error" => Some(LogLevel::LogError),
                "warn" => Some(LogLevel::LogWarn),
                "info" => Some(LogLevel::LogInfo),
                "debug" | "all" => Some(LogLevel::LogDebug),
                _ => None,
            };
            if let Some(level) = parsed {
                LEVEL.store(level as usize, Ordering::Relaxed);
            }
        }
    });
}

pub fn enabled(level: LogLevel) -> bool {
    init_from_env();
    (level as usize) <= LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn write_line(level: LogLevel, args: std::fmt::Arguments) {
    eprintln!("[rd {}] {}", level.tag(), args);
}

/// Log a message at the given level if it's enabled, in the style used
/// throughout the session and recorder/replayer code: `log!(LogDebug, "...", args)`.
#[macro_export]
macro_rules! log {
    ($level:ident, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::$level) {
            $crate::log::write_line($crate::log::LogLevel::$level, format_args!($($arg)*));
        }
    };
}

/// Assert a condition about a tracee; on failure, logs and aborts the
/// process rather than unwinding through in-flight ptrace state.
#[macro_export]
macro_rules! ed_assert {
    ($tid:expr, $cond:expr) => {
        if !($cond) {
            $crate::log::write_line(
                $crate::log::LogLevel::LogFatal,
                format_args!("tid {}: assertion failed: {}", $tid, stringify!($cond)),
            );
            std::process::exit(1);
        }
    };
    ($tid:expr, $cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::log::write_line(
                $crate::log::LogLevel::LogFatal,
                format_args!("tid {}: {}", $tid, format_args!($($arg)*)),
            );
            std::process::exit(1);
        }
    };
}
