//! Kernel-style log macros
//!
//! Leveled, line-atomic output to stderr in the spirit of `printk`.
//!
//! # Environment Variables
//!
//! - `IOS_LOG_LEVEL=<level>` - `off|error|warn|info|debug|trace` or `0`..`5`
//! - `IOS_LOG_FLUSH=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use iosched_core::{kinfo, kwarn};
//!
//! kinfo!("{}: iosched attached, sort={}", periph, sort);
//! kwarn!("{}: flushed {} bios with errno {}", periph, n, err);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

/// Log levels, least to most verbose
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
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit. Unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

static ENV_INIT: Once = Once::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);

/// Read `IOS_LOG_LEVEL` / `IOS_LOG_FLUSH` once.
///
/// Runs on first use; explicit calls make initialization order deterministic.
/// Levels set with [`set_log_level`] before this runs are overwritten only if
/// the environment names a valid level.
pub fn init() {
    ENV_INIT.call_once(|| {
        if let Some(level) = std::env::var("IOS_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
        {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
        if crate::env::env_get_bool("IOS_LOG_FLUSH", false) {
            FLUSH.store(true, Ordering::Relaxed);
        }
    });
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush(enabled: bool) {
    init();
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

fn emit(prefix: Option<LogLevel>, args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    if let Some(level) = prefix {
        let _ = write!(out, "iosched[{}]: ", level.tag());
    }
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    init();
    emit(None, args);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args);
    }
}

/// Unconditional line to stderr
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::klog::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::klog::_kprintln_impl(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog::_klog_impl($crate::klog::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog::_klog_impl($crate::klog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog::_klog_impl($crate::klog::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog::_klog_impl($crate::klog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog::_klog_impl($crate::klog::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" 2 "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(42), LogLevel::Trace);
    }

    #[test]
    fn test_off_disables_everything() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        assert!(!level_enabled(LogLevel::Off));

        kerror!("error {}", 1);
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
