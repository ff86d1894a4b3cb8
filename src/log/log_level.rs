/// Defines the severity levels for log messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Designates very fine-grained informational events.
    Trace,
    /// Designates fine-grained informational events that are most useful to debug an application.
    Debug,
    /// Designates informational messages that highlight the progress of the application at coarse-grained level.
    Info,
    /// Designates potentially harmful situations.
    Warn,
    /// Designates error events that might still allow the application to continue running.
    Error,
}

impl LogLevel {
    /// Fixed-width tag for the log file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO ",
            Self::Warn => "WARN ",
            Self::Error => "ERROR",
        }
    }

    /// Verbosity flags handed down to child daemons (`-d`, `-q`, ...).
    #[must_use]
    pub const fn child_verbosity(self) -> Option<&'static str> {
        match self {
            Self::Trace => Some("-dd"),
            Self::Debug => Some("-d"),
            Self::Info => None,
            Self::Warn => Some("-q"),
            Self::Error => Some("-qq"),
        }
    }
}
