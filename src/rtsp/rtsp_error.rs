use std::fmt;
use std::io;

/// Transport and codec errors of the RTSP layer.
#[derive(Debug)]
pub enum RtspError {
    Io(io::Error),
    /// Malformed wire data or a message violating the framing rules.
    Protocol(&'static str),
    /// Attempt to mutate a sealed message.
    Busy,
    /// The bus saw a fatal I/O error; no further sends succeed.
    Dead,
    /// Operation not valid for this message type or bus state.
    InvalidState,
}

impl fmt::Display for RtspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(what) => write!(f, "protocol error: {what}"),
            Self::Busy => write!(f, "message is sealed"),
            Self::Dead => write!(f, "bus is dead"),
            Self::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl From<io::Error> for RtspError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
