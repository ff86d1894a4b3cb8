use std::fmt;
use std::io;

#[derive(Debug)]
pub enum EncoderError {
    Io(io::Error),
    /// Handshake or state line the supervisor cannot interpret.
    Protocol(&'static str),
    /// Command issued while the control channel is not up.
    NotConnected,
    /// The child is gone.
    Died,
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(what) => write!(f, "protocol error: {what}"),
            Self::NotConnected => write!(f, "encoder control channel not connected"),
            Self::Died => write!(f, "encoder process died"),
        }
    }
}

impl From<io::Error> for EncoderError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
