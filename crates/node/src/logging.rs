//! Process-wide leveled logging. Warnings and errors go to stderr, the rest
//! to stdout; the level comes from `--log-level` or the `FINCHD_LOG` env var.

use std::sync::atomic::{AtomicU8, Ordering};

pub const LEVEL_ERROR: u8 = 0;
pub const LEVEL_WARN: u8 = 1;
pub const LEVEL_INFO: u8 = 2;
pub const LEVEL_DEBUG: u8 = 3;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_INFO);

pub fn set_log_level(level: u8) {
    LOG_LEVEL.store(level, Ordering::Relaxed);
}

pub fn log_enabled(level: u8) -> bool {
    level <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn parse_level(value: &str) -> Option<u8> {
    match value {
        "error" => Some(LEVEL_ERROR),
        "warn" => Some(LEVEL_WARN),
        "info" => Some(LEVEL_INFO),
        "debug" => Some(LEVEL_DEBUG),
        _ => None,
    }
}

macro_rules! log_error {
    ($($arg:tt)*) => {
        if crate::logging::log_enabled(crate::logging::LEVEL_ERROR) {
            eprintln!($($arg)*);
        }
    };
}

macro_rules! log_warn {
    ($($arg:tt)*) => {
        if crate::logging::log_enabled(crate::logging::LEVEL_WARN) {
            eprintln!($($arg)*);
        }
    };
}

macro_rules! log_info {
    ($($arg:tt)*) => {
        if crate::logging::log_enabled(crate::logging::LEVEL_INFO) {
            println!($($arg)*);
        }
    };
}

macro_rules! log_debug {
    ($($arg:tt)*) => {
        if crate::logging::log_enabled(crate::logging::LEVEL_DEBUG) {
            println!($($arg)*);
        }
    };
}
