//! Leveled logging over the serial console.
//!
//! The level values are shared with the `log_string` syscall, which is why
//! the numbering has gaps: applications pass the same constants.

use core::sync::atomic::{AtomicU8, Ordering};

/// Log severity. Lower value = more severe.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 3,
    Warn = 4,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    /// Map a raw syscall argument onto a level
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Warn),
            6 => Some(LogLevel::Info),
            7 => Some(LogLevel::Debug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

/// Set the process-wide log threshold
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Would a message at `level` currently be emitted?
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: core::fmt::Arguments) {
    if enabled(level) {
        crate::serial_println!("[{}] {}", level.as_str(), args);
    }
}

/// Log a formatted message at the given level
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::_log($level, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_threshold() {
        set_log_level(LogLevel::Warn);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Info));
        assert!(!enabled(LogLevel::Debug));

        set_log_level(LogLevel::Debug);
        assert!(enabled(LogLevel::Debug));
        set_log_level(LogLevel::Warn);
    }

    #[test]
    fn test_from_raw_rejects_unknown() {
        assert_eq!(LogLevel::from_raw(3), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_raw(6), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_raw(0), None);
        assert_eq!(LogLevel::from_raw(5), None);
    }
}
