// Category-based logging infrastructure
//
// Six priority levels, an env var to raise verbosity, and
// `file!():line!()` prefixing. This is intentionally small -- it
// exists so the rest of the crate doesn't reach for a full logging
// framework for what amounts to eprintln! with a level filter.

#[allow(dead_code, non_camel_case_types)]
pub enum LogLevel {
    critical,
    error,
    debug,
    verbose,
    info,
    profiling,
}

impl LogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::critical => "critical",
            LogLevel::error => "error",
            LogLevel::debug => "debug",
            LogLevel::verbose => "verbose",
            LogLevel::info => "info",
            LogLevel::profiling => "profiling",
        }
    }

    pub fn level(&self) -> u32 {
        match self {
            LogLevel::critical => 0,
            LogLevel::error => 1,
            LogLevel::debug => 2,
            LogLevel::verbose => 3,
            LogLevel::info => 4,
            LogLevel::profiling => 5,
        }
    }
}

#[macro_export]
macro_rules! log_internal {
    ($level:expr, $($format_args:tt)+) => {{
        lazy_static::lazy_static! {
            static ref DEFAULT_LEVEL: u32 = $crate::log::LogLevel::error.level();
            static ref LOG_LEVEL: u32 = match std::env::var("HUT_LOG") {
                Ok(val) => match val.as_str() {
                    "debug" => $crate::log::LogLevel::debug.level(),
                    "verbose" => $crate::log::LogLevel::verbose.level(),
                    "info" => $crate::log::LogLevel::info.level(),
                    "profiling" => $crate::log::LogLevel::profiling.level(),
                    _ => *DEFAULT_LEVEL,
                },
                Err(_) => *DEFAULT_LEVEL,
            };
        }

        let level: $crate::log::LogLevel = $level;
        if level.level() <= *LOG_LEVEL {
            eprintln!(
                "[{}] {}:{} - {}",
                level.name(),
                file!(),
                line!(),
                format!($($format_args)+)
            );
        }
    }};
}

#[macro_export]
macro_rules! critical {
    ($($a:tt)+) => { $crate::log_internal!($crate::log::LogLevel::critical, $($a)+) };
}
#[macro_export]
macro_rules! error {
    ($($a:tt)+) => { $crate::log_internal!($crate::log::LogLevel::error, $($a)+) };
}
#[macro_export]
macro_rules! debug {
    ($($a:tt)+) => { $crate::log_internal!($crate::log::LogLevel::debug, $($a)+) };
}
#[macro_export]
macro_rules! verbose {
    ($($a:tt)+) => { $crate::log_internal!($crate::log::LogLevel::verbose, $($a)+) };
}
#[macro_export]
macro_rules! info {
    ($($a:tt)+) => { $crate::log_internal!($crate::log::LogLevel::info, $($a)+) };
}
#[macro_export]
macro_rules! profiling {
    ($($a:tt)+) => { $crate::log_internal!($crate::log::LogLevel::profiling, $($a)+) };
}

pub use crate::{critical, debug, error, info, profiling, verbose};
