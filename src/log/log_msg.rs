use std::time::{SystemTime, UNIX_EPOCH};

use crate::log::log_level::LogLevel;

#[derive(Debug, Clone)]
pub struct LogMsg {
    pub level: LogLevel,
    pub ts_ms: u128,
    pub text: String,
    pub target: &'static str, // module path
}

impl LogMsg {
    pub fn new(level: LogLevel, text: impl Into<String>, target: &'static str) -> Self {
        Self {
            level,
            ts_ms: now_millis(),
            text: text.into(),
            target,
        }
    }
}

/// Milliseconds since the unix epoch; 0 if the clock is before it.
#[must_use]
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
