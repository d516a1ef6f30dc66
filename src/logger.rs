//! Pluggable logging for stream and reactor events.
//!
//! Streams and the event loop never log directly; they go through the
//! [`Logger`] held in their configuration. The default, [`TracingLogger`],
//! forwards to the `tracing` crate so applications pick up stream events with
//! whatever subscriber they already installed.

/// Log levels for stream events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for stream events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Logger that emits through `tracing` under the `hijack_io` target.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "hijack_io", "{}", message),
            LogLevel::Info => tracing::info!(target: "hijack_io", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "hijack_io", "{}", message),
            LogLevel::Error => tracing::error!(target: "hijack_io", "{}", message),
        }
    }
}
