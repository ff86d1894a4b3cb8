use crate::log::log_level::LogLevel;

/// Defines a destination (sink) for log messages.
///
/// Implementations must be `Send` and `Sync` so a single sink can be shared
/// by the control loop and its worker threads.
pub trait LogSink: Send + Sync {
    /// Records a log message.
    ///
    /// # Arguments
    ///
    /// * `level` - The severity level of the log message.
    /// * `msg` - The content of the log message.
    /// * `target` - The static source of the log (e.g., module path).
    fn log(&self, level: LogLevel, msg: &str, target: &'static str);
}
