//! The M1–M16 dispatch model.
//!
//! Each Miracast exchange step has one table entry per role, naming an
//! outgoing request builder, an incoming request handler and a reply
//! post-processor, plus a declarative rule list applied after the
//! handler succeeded: advance the session state and/or fire the next
//! request of the sequence. An id whose entry declares no rule leaves
//! the session state untouched.

use std::fmt;

use crate::rtsp::Message;
use crate::wfd::session::{SessionState, WfdSession};
use crate::wfd::wfd_error::WfdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    M1RequestSinkOptions,
    M2RequestSrcOptions,
    M3GetParameter,
    M4SetParameter,
    M5Trigger,
    M6Setup,
    M7Play,
    M8Teardown,
    M9Pause,
    M10SetRoute,
    M11SetConnectorType,
    M12SetStandby,
    M13RequestIdr,
    M14EstablishUibc,
    M15EnableUibc,
    M16KeepAlive,
}

impl MessageId {
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8 + 1
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M1RequestSinkOptions => "REQUEST_SINK_OPTIONS",
            Self::M2RequestSrcOptions => "REQUEST_SRC_OPTIONS",
            Self::M3GetParameter => "GET_PARAMETER",
            Self::M4SetParameter => "SET_PARAMETER",
            Self::M5Trigger => "TRIGGER",
            Self::M6Setup => "SETUP",
            Self::M7Play => "PLAY",
            Self::M8Teardown => "TEARDOWN",
            Self::M9Pause => "PAUSE",
            Self::M10SetRoute => "SET_ROUTE",
            Self::M11SetConnectorType => "SET_CONNECTOR_TYPE",
            Self::M12SetStandby => "SET_STANDBY",
            Self::M13RequestIdr => "REQUEST_IDR",
            Self::M14EstablishUibc => "ESTABLISH_UIBC",
            Self::M15EnableUibc => "ENABLE_UIBC",
            Self::M16KeepAlive => "KEEPALIVE",
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (M{})", self.as_str(), self.number())
    }
}

/// Stream control verbs carried by an M5 trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMethod {
    Setup,
    Play,
    Pause,
    Teardown,
}

impl TriggerMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for TriggerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-handler rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    NextRequest(MessageId),
    NewState(SessionState),
    RequestArgs(TriggerMethod),
}

pub type RequestFn = fn(&mut WfdSession, Option<TriggerMethod>) -> Result<Message, WfdError>;
pub type HandleRequestFn = fn(&mut WfdSession, &Message) -> Result<Message, WfdError>;
pub type HandleReplyFn = fn(&mut WfdSession, &Message) -> Result<(), WfdError>;

pub struct DispatchEntry {
    /// Builder when this side initiates the message.
    pub request: Option<RequestFn>,
    /// Handler when this side receives it; returns the reply to send.
    pub handle_request: Option<HandleRequestFn>,
    /// Post-processor for the reply to our own request.
    pub handle_reply: Option<HandleReplyFn>,
    pub rules: &'static [Rule],
}

impl DispatchEntry {
    pub const EMPTY: Self = Self {
        request: None,
        handle_request: None,
        handle_reply: None,
        rules: &[],
    };
}

/// One entry per `MessageId`, indexed by `MessageId::index`.
pub type DispatchTable = [DispatchEntry; 16];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_number_1_to_16() {
        assert_eq!(MessageId::M1RequestSinkOptions.number(), 1);
        assert_eq!(MessageId::M16KeepAlive.number(), 16);
        assert_eq!(MessageId::M16KeepAlive.index(), 15);
    }

    #[test]
    fn trigger_methods_render_upper_case() {
        assert_eq!(TriggerMethod::Setup.to_string(), "SETUP");
        assert_eq!(TriggerMethod::Teardown.to_string(), "TEARDOWN");
    }
}
