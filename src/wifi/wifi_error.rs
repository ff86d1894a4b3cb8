use std::fmt;
use std::io;

#[derive(Debug)]
pub enum WifiError {
    Io(io::Error),
    /// Malformed control-interface traffic.
    Parse(&'static str),
    /// A second operation while one is still pending.
    Already,
    /// The supplicant is not ready for commands.
    NotReady,
    /// Bad argument from the caller (empty name, unknown provision type).
    InvalidArgument(&'static str),
    /// Child process could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Parse(what) => write!(f, "parse error: {what}"),
            Self::Already => write!(f, "already pending"),
            Self::NotReady => write!(f, "supplicant not ready"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::Spawn(e) => write!(f, "cannot spawn child: {e}"),
        }
    }
}

impl From<io::Error> for WifiError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
