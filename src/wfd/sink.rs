//! Exported sink wrapper: a connected peer seen through its WFD role.

use crate::wfd::sube::{self, DeviceInfo};
use crate::wfd::wfd_error::WfdError;

/// A peer advertising a sink role, addressable as `mac@link`.
#[derive(Debug)]
pub struct WfdSink {
    /// Peer P2P device address (canonical form).
    pub peer_mac: String,
    /// Owning link ifindex.
    pub link: u32,
    /// Parsed Device Info sub-element: role and RTSP port.
    pub dev_info: DeviceInfo,
    /// Current session id, if one is running.
    pub session: Option<u32>,
}

impl WfdSink {
    /// Wrap a peer whose sub-elements advertise a sink role.
    ///
    /// # Errors
    /// Sub-element parse failures; `Protocol` when the peer is no sink.
    pub fn from_subelements(link: u32, peer_mac: &str, subelements: &str) -> Result<Self, WfdError> {
        let dev_info = sube::find_device_info(subelements)?;
        if !dev_info.is_sink() {
            return Err(WfdError::Protocol("peer is not a sink"));
        }
        Ok(Self {
            peer_mac: peer_mac.to_string(),
            link,
            dev_info,
            session: None,
        })
    }

    /// Label shown to the facade.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}@{}", self.peer_mac, self.link)
    }

    /// Claim the sink for a new session.
    ///
    /// # Errors
    /// `Already` while a session exists.
    pub fn claim_session(&mut self, session: u32) -> Result<(), WfdError> {
        if self.session.is_some() {
            return Err(WfdError::Already);
        }
        self.session = Some(session);
        Ok(())
    }

    pub fn release_session(&mut self) {
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn sink_wraps_device_info() {
        let s = WfdSink::from_subelements(3, "02:aa:bb:cc:dd:ee", "00000600061c4400c8")
            .expect("sink parses");
        assert_eq!(s.dev_info.rtsp_port, 7236);
        assert_eq!(s.label(), "02:aa:bb:cc:dd:ee@3");
    }

    #[test]
    fn source_peers_are_rejected() {
        // dev_info low bits 00 -> Source role.
        let r = WfdSink::from_subelements(3, "02:aa:bb:cc:dd:ee", "00000600041c4400c8");
        assert!(r.is_err());
    }

    #[test]
    fn second_claim_fails_with_already() {
        let mut s = WfdSink::from_subelements(3, "02:aa:bb:cc:dd:ee", "00000600061c4400c8")
            .expect("sink parses");
        s.claim_session(1).expect("first claim");
        match s.claim_session(2) {
            Err(WfdError::Already) => {}
            other => panic!("expected Already, got {other:?}"),
        }
        s.release_session();
        s.claim_session(2).expect("after release");
    }
}
