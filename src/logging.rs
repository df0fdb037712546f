//! Replay-gated logging for orchestration code.
//!
//! Orchestrations are re-executed from history on every resume, so plain
//! `tracing` calls inside them would fire once per replay. The macros below
//! buffer into the turn's log buffer instead; the runtime flushes the buffer
//! only on turns that make forward progress (a new decision was recorded or
//! the orchestration finished), which keeps pure replay turns silent.

/// Severity carried by the per-turn log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[macro_export]
macro_rules! replay_info {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.push_log($crate::LogLevel::Info, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! replay_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.push_log($crate::LogLevel::Warn, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! replay_error {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.push_log($crate::LogLevel::Error, format!($($arg)+));
    }};
}
