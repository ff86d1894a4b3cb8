use std::fmt;

use crate::rtsp::RtspError;
use crate::wifi::wifi_error::WifiError;

#[derive(Debug)]
pub enum WfdError {
    /// Peer sent something the session cannot accept.
    Protocol(&'static str),
    Rtsp(RtspError),
    Wifi(WifiError),
    Io(std::io::Error),
    /// Operation not allowed in the current session state.
    InvalidState(&'static str),
    /// A session already exists on this link.
    Already,
    /// Sub-element TLV parse failure.
    Sube(&'static str),
}

impl fmt::Display for WfdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(what) => write!(f, "protocol error: {what}"),
            Self::Rtsp(e) => write!(f, "RTSP error: {e}"),
            Self::Wifi(e) => write!(f, "Wi-Fi error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidState(what) => write!(f, "invalid state: {what}"),
            Self::Already => write!(f, "already exists"),
            Self::Sube(what) => write!(f, "sub-element error: {what}"),
        }
    }
}

impl From<RtspError> for WfdError {
    fn from(e: RtspError) -> Self {
        Self::Rtsp(e)
    }
}

impl From<WifiError> for WfdError {
    fn from(e: WifiError) -> Self {
        Self::Wifi(e)
    }
}

impl From<std::io::Error> for WfdError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
