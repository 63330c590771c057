//! Kernel console output and logging
//!
//! Output goes to the debug console port. Level macros are gated by cargo
//! features so a release build can compile the chatter out entirely:
//! `log-error` < `log-warn` < `log-info` (default) < `log-debug` < `log-trace`.

use core::fmt;

/// Writer over the debug console.
pub struct DebugWriter;

impl fmt::Write for DebugWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            crate::arch::debug_putc(byte);
        }
        Ok(())
    }
}

/// Log levels, lowest value = most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

/// The log level selected at compile time.
#[inline(always)]
pub const fn current_log_level() -> LogLevel {
    #[cfg(feature = "log-trace")]
    return LogLevel::Trace;

    #[cfg(all(feature = "log-debug", not(feature = "log-trace")))]
    return LogLevel::Debug;

    #[cfg(all(
        feature = "log-info",
        not(any(feature = "log-debug", feature = "log-trace"))
    ))]
    return LogLevel::Info;

    #[cfg(all(
        feature = "log-warn",
        not(any(feature = "log-info", feature = "log-debug", feature = "log-trace"))
    ))]
    return LogLevel::Warn;

    #[cfg(all(
        feature = "log-error",
        not(any(
            feature = "log-warn",
            feature = "log-info",
            feature = "log-debug",
            feature = "log-trace"
        ))
    ))]
    return LogLevel::Error;

    #[cfg(not(any(
        feature = "log-error",
        feature = "log-warn",
        feature = "log-info",
        feature = "log-debug",
        feature = "log-trace"
    )))]
    return LogLevel::Info;
}

/// Whether messages at `level` should be emitted.
#[inline(always)]
pub const fn should_log(level: LogLevel) -> bool {
    level as u8 <= current_log_level() as u8
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = write!($crate::debug::DebugWriter, $($arg)*);
    });
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = writeln!($crate::debug::DebugWriter, $($arg)*);
    });
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Error) {
            $crate::kprintln!("[ERROR] {}", format_args!($($arg)*));
        }
    });
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Warn) {
            $crate::kprintln!("[WARN]  {}", format_args!($($arg)*));
        }
    });
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Info) {
            $crate::kprintln!("[INFO]  {}", format_args!($($arg)*));
        }
    });
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Debug) {
            $crate::kprintln!("[DEBUG] {}", format_args!($($arg)*));
        }
    });
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Trace) {
            $crate::kprintln!("[TRACE] {}", format_args!($($arg)*));
        }
    });
}

/// Scheduler debug output, compiled in only with the `debug-scheduler` feature.
#[macro_export]
macro_rules! ksched_debug {
    ($($arg:tt)*) => ({
        #[cfg(feature = "debug-scheduler")]
        {
            $crate::kprintln!($($arg)*);
        }
    });
}
