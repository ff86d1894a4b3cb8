//! Source (outgoing) role of the session state machine.
//!
//! The Source binds a TCP listener on its group-local address at the
//! RTSP port the peer advertised in its Device Info sub-element, waits
//! for the sink to dial in, and then drives capability exchange (M1,
//! M3, M4), hands out stream-control triggers (M5) and answers the
//! sink's SETUP/PLAY/PAUSE/TEARDOWN. The media encoder child is
//! configured during SETUP and started/paused on the sink's commands;
//! its state changes move the session between Playing and Paused.

use std::net::TcpListener;
use std::time::Instant;

use crate::encoder::EncoderState;
use crate::log::LogSink;
use crate::rtsp::{Message, status};
use crate::wfd::dispatch::{DispatchEntry, DispatchTable, MessageId, Rule, TriggerMethod};
use crate::wfd::formats::{AudioCodecs, VideoFormats};
use crate::wfd::session::{
    LOCAL_RTCP_PORT, LOCAL_RTP_PORT, SESSION_TIMEOUT, SessionDir, SessionState, StreamId,
    WfdSession,
};
use crate::wfd::wfd_error::WfdError;
use crate::sink_warn;

/// Methods we announce in the M2 answer.
const PUBLIC_METHODS: &str =
    "org.wfa.wfd1.0, SETUP, TEARDOWN, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER";

impl WfdSession {
    /// A Source-role session streaming from `local_addr` to a sink that
    /// listens on `rtsp_port` (from its Device Info sub-element).
    #[must_use]
    pub fn new_out(
        id: u32,
        local_addr: &str,
        rtsp_port: u16,
        log: std::sync::Arc<dyn LogSink>,
    ) -> Self {
        Self::new(
            id,
            SessionDir::Out,
            out_session_table(),
            local_addr.to_string(),
            rtsp_port,
            log,
        )
    }

    /// Bind the listening socket for the sink to dial.
    ///
    /// # Errors
    /// `InvalidState` when already started; bind failures.
    pub fn initiate_io(&mut self) -> Result<TcpListener, WfdError> {
        if self.state() != SessionState::Null {
            return Err(WfdError::InvalidState("session already started"));
        }
        let listener = TcpListener::bind((self.local_addr.as_str(), self.rtsp_port))?;
        self.set_state(SessionState::Connecting);
        Ok(listener)
    }
}

// ---- Outgoing request builders ---------------------------------------

fn request_options(
    _s: &mut WfdSession,
    _args: Option<TriggerMethod>,
) -> Result<Message, WfdError> {
    let mut m = Message::request("OPTIONS", "*");
    m.append_header("Require", "org.wfa.wfd1.0")?;
    Ok(m)
}

fn request_get_parameter(
    _s: &mut WfdSession,
    _args: Option<TriggerMethod>,
) -> Result<Message, WfdError> {
    let mut m = Message::request("GET_PARAMETER", "rtsp://localhost/wfd1.0");
    m.set_parameter_body("wfd_video_formats\nwfd_audio_codecs\nwfd_client_rtp_ports")?;
    Ok(m)
}

fn request_set_parameter(
    s: &mut WfdSession,
    _args: Option<TriggerMethod>,
) -> Result<Message, WfdError> {
    s.gen_stream_url(StreamId::Primary);
    let url = s
        .stream
        .url
        .clone()
        .ok_or(WfdError::InvalidState("no stream url"))?;

    let body = format!(
        "wfd_video_formats: 00 00 02 10 {:08X} {:08X} {:08X} 00 0000 0000 00 none none\n\
         wfd_audio_codecs: AAC 00000001 00\n\
         wfd_presentation_URL: {} none\n\
         wfd_client_rtp_ports: RTP/AVP/UDP;unicast {} {} mode=play",
        0x80u32, 0u32, 0u32, url, s.rtp_ports.0, s.rtp_ports.1
    );

    let mut m = Message::request("SET_PARAMETER", "rtsp://localhost/wfd1.0");
    m.set_parameter_body(body)?;
    Ok(m)
}

fn request_trigger(s: &mut WfdSession, args: Option<TriggerMethod>) -> Result<Message, WfdError> {
    let method = args.ok_or(WfdError::Protocol("trigger without method"))?;
    let url = s
        .stream
        .url
        .clone()
        .ok_or(WfdError::InvalidState("no stream url"))?;

    let mut m = Message::request("SET_PARAMETER", url);
    m.set_parameter_body(format!("wfd_trigger_method: {method}"))?;
    Ok(m)
}

fn request_keep_alive(
    s: &mut WfdSession,
    _args: Option<TriggerMethod>,
) -> Result<Message, WfdError> {
    let mut m = Message::request("GET_PARAMETER", "rtsp://localhost/wfd1.0");
    m.append_header("Session", format!("{:X}", s.id()))?;
    Ok(m)
}

// ---- Reply processors ------------------------------------------------

fn handle_options_reply(_s: &mut WfdSession, m: &Message) -> Result<(), WfdError> {
    let public = m
        .header_value("Public")
        .ok_or(WfdError::Protocol("OPTIONS reply without Public"))?;
    let methods: Vec<&str> = public.split(',').map(str::trim).collect();

    for required in ["org.wfa.wfd1.0", "SET_PARAMETER", "GET_PARAMETER"] {
        if !methods.contains(&required) {
            return Err(WfdError::Protocol("sink misses a required method"));
        }
    }
    Ok(())
}

fn handle_get_parameter_reply(s: &mut WfdSession, m: &Message) -> Result<(), WfdError> {
    if let Some(v) = m.body_param("wfd_video_formats") {
        s.vformats = VideoFormats::parse(v)?;
    }
    if let Some(v) = m.body_param("wfd_audio_codecs") {
        s.acodecs = AudioCodecs::parse(v)?;
    }
    if let Some(v) = m.body_param("wfd_client_rtp_ports") {
        let t: Vec<&str> = v.split_whitespace().collect();
        if t.len() < 4 || t[0] != "RTP/AVP/UDP;unicast" || !t[3].starts_with("mode=play") {
            return Err(WfdError::Protocol("malformed wfd_client_rtp_ports"));
        }
        let p0: u16 = t[1]
            .parse()
            .map_err(|_| WfdError::Protocol("bad client rtp port"))?;
        let p1: u16 = t[2]
            .parse()
            .map_err(|_| WfdError::Protocol("bad client rtcp port"))?;
        if p0 == 0 && p1 == 0 {
            return Err(WfdError::Protocol("client rtp ports both zero"));
        }
        s.rtp_ports = (p0, p1);
    }
    Ok(())
}

// ---- Incoming request handlers ---------------------------------------

fn handle_options_request(_s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    let require = req
        .header_value("Require")
        .ok_or(WfdError::Protocol("OPTIONS without Require"))?;

    if require != "org.wfa.wfd1.0" {
        let rep = Message::reply_for(
            req,
            status::OPTION_NOT_SUPPORTED,
            Some("Invalid specification"),
        )?;
        return Ok(rep);
    }

    let mut rep = Message::reply_for(req, status::OK, None)?;
    rep.append_header("Public", PUBLIC_METHODS)?;
    Ok(rep)
}

fn handle_setup_request(s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    let transport = req
        .header_value("Transport")
        .ok_or(WfdError::Protocol("SETUP without Transport"))?;

    let rest = transport
        .strip_prefix("RTP/AVP/UDP;unicast;")
        .ok_or(WfdError::Protocol("unsupported transport"))?;
    let ports = rest
        .strip_prefix("client_port=")
        .ok_or(WfdError::Protocol("transport without client_port"))?;

    let end = ports
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(ports.len());
    let rtp: u16 = ports[..end]
        .parse()
        .map_err(|_| WfdError::Protocol("bad client rtp port"))?;
    let tail = &ports[end..];

    let rtcp = match tail.strip_prefix('-') {
        Some(t) => {
            let e = t.find(|c: char| !c.is_ascii_digit()).unwrap_or(t.len());
            t[..e]
                .parse()
                .map_err(|_| WfdError::Protocol("bad client rtcp port"))?
        }
        None => 0,
    };

    s.stream.rtp_port = rtp;
    s.stream.rtcp_port = rtcp;

    let mut rep = Message::reply_for(req, status::OK, None)?;
    rep.append_header(
        "Session",
        format!("{:X};timeout={}", s.id(), SESSION_TIMEOUT.as_secs()),
    )?;
    rep.append_header(
        "Transport",
        format!(
            "RTP/AVP/UDP;unicast;client_port={rtp}{tail};server_port={LOCAL_RTP_PORT}-{LOCAL_RTCP_PORT}"
        ),
    )?;

    if s.encoder
        .as_ref()
        .is_some_and(|e| e.state() == EncoderState::Spawned)
    {
        let cfg = s.encoder_config();
        if let Some(enc) = s.encoder.as_mut()
            && enc.configure(&cfg).is_err()
        {
            sink_warn!(s.log, "session {:X}: encoder configure failed", s.id());
        }
    }

    s.arm_keep_alive(Instant::now());
    Ok(rep)
}

fn handle_play_request(s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    let mut rep = Message::reply_for(req, status::OK, None)?;
    rep.append_header("Session", format!("{:X}", s.id()))?;

    if s.encoder
        .as_ref()
        .is_some_and(|e| e.state() >= EncoderState::Configured)
        && let Some(enc) = s.encoder.as_mut()
        && enc.start().is_err()
    {
        sink_warn!(s.log, "session {:X}: encoder start failed", s.id());
    }

    Ok(rep)
}

fn handle_pause_request(s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    if let Some(enc) = s.encoder.as_mut()
        && enc.pause().is_err()
    {
        sink_warn!(s.log, "session {:X}: encoder pause failed", s.id());
    }
    Ok(Message::reply_for(req, status::OK, None)?)
}

fn handle_teardown_request(_s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    Ok(Message::reply_for(req, status::OK, None)?)
}

fn handle_idr_request(_s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    Ok(Message::reply_for(req, status::OK, None)?)
}

fn reply_not_implemented(_s: &mut WfdSession, req: &Message) -> Result<Message, WfdError> {
    Ok(Message::reply_for(req, status::NOT_IMPLEMENTED, None)?)
}

// ---- The table -------------------------------------------------------

static RULES_M1: [Rule; 1] = [Rule::NextRequest(MessageId::M3GetParameter)];
static RULES_M2: [Rule; 1] = [Rule::NextRequest(MessageId::M3GetParameter)];
static RULES_M3: [Rule; 1] = [Rule::NextRequest(MessageId::M4SetParameter)];
static RULES_M4: [Rule; 3] = [
    Rule::NextRequest(MessageId::M5Trigger),
    Rule::NewState(SessionState::Established),
    Rule::RequestArgs(TriggerMethod::Setup),
];
static RULES_M6: [Rule; 1] = [Rule::NewState(SessionState::SettingUp)];
static RULES_M8: [Rule; 1] = [Rule::NewState(SessionState::TearingDown)];

static OUT_SESSION_TABLE: DispatchTable = [
    // M1: our OPTIONS probe.
    DispatchEntry {
        request: Some(request_options),
        handle_request: None,
        handle_reply: Some(handle_options_reply),
        rules: &RULES_M1,
    },
    // M2: the sink's OPTIONS probe.
    DispatchEntry {
        request: None,
        handle_request: Some(handle_options_request),
        handle_reply: None,
        rules: &RULES_M2,
    },
    // M3: capability query.
    DispatchEntry {
        request: Some(request_get_parameter),
        handle_request: None,
        handle_reply: Some(handle_get_parameter_reply),
        rules: &RULES_M3,
    },
    // M4: capability selection.
    DispatchEntry {
        request: Some(request_set_parameter),
        handle_request: None,
        handle_reply: None,
        rules: &RULES_M4,
    },
    // M5: stream-control trigger.
    DispatchEntry {
        request: Some(request_trigger),
        handle_request: None,
        handle_reply: None,
        rules: &[],
    },
    // M6: SETUP.
    DispatchEntry {
        request: None,
        handle_request: Some(handle_setup_request),
        handle_reply: None,
        rules: &RULES_M6,
    },
    // M7: PLAY.
    DispatchEntry {
        request: None,
        handle_request: Some(handle_play_request),
        handle_reply: None,
        rules: &[],
    },
    // M8: TEARDOWN.
    DispatchEntry {
        request: None,
        handle_request: Some(handle_teardown_request),
        handle_reply: None,
        rules: &RULES_M8,
    },
    // M9: PAUSE.
    DispatchEntry {
        request: None,
        handle_request: Some(handle_pause_request),
        handle_reply: None,
        rules: &[],
    },
    // M10: route selection, audio-only devices.
    DispatchEntry {
        request: None,
        handle_request: Some(reply_not_implemented),
        handle_reply: None,
        rules: &[],
    },
    // M11: connector type.
    DispatchEntry {
        request: None,
        handle_request: Some(reply_not_implemented),
        handle_reply: None,
        rules: &[],
    },
    // M12: standby.
    DispatchEntry {
        request: None,
        handle_request: Some(reply_not_implemented),
        handle_reply: None,
        rules: &[],
    },
    // M13: IDR picture request.
    DispatchEntry {
        request: None,
        handle_request: Some(handle_idr_request),
        handle_reply: None,
        rules: &[],
    },
    // M14: UIBC negotiation, not offered.
    DispatchEntry::EMPTY,
    // M15: UIBC enable.
    DispatchEntry {
        request: None,
        handle_request: Some(reply_not_implemented),
        handle_reply: None,
        rules: &[],
    },
    // M16: keep-alive.
    DispatchEntry {
        request: Some(request_keep_alive),
        handle_request: None,
        handle_reply: None,
        rules: &[],
    },
];

pub(crate) fn out_session_table() -> &'static DispatchTable {
    &OUT_SESSION_TABLE
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use crate::log::NoopLogSink;
    use crate::rtsp::{Message, Parser};
    use crate::wfd::session::WfdEvent;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn out_session() -> WfdSession {
        let mut s = WfdSession::new_out(0x2A, "192.168.77.1", 7236, Arc::new(NoopLogSink));
        s.attach_transport();
        s
    }

    /// Pull and parse everything the session queued for the wire.
    fn wire_messages(s: &mut WfdSession) -> Vec<Message> {
        let mut p = Parser::new();
        for raw in s.take_wire() {
            p.feed(&raw).expect("session wire output parses");
        }
        let mut v = Vec::new();
        while let Some(m) = p.next_message() {
            v.push(m);
        }
        v
    }

    fn reply_ok(req: &Message, headers: &[(&str, &str)], body: Option<&str>) -> Vec<u8> {
        let mut text = format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n", req.wire_cookie());
        for (k, v) in headers {
            text.push_str(&format!("{k}: {v}\r\n"));
        }
        match body {
            Some(b) => {
                text.push_str(&format!(
                    "Content-Type: text/parameters\r\nContent-Length: {}\r\n\r\n{}",
                    b.len(),
                    b
                ));
            }
            None => text.push_str("\r\n"),
        }
        text.into_bytes()
    }

    fn drive_to_established(s: &mut WfdSession, now: Instant) {
        s.start_caps_exchange(now).expect("caps exchange starts");

        // M1: OPTIONS * with the WFD requirement.
        let m1 = wire_messages(s);
        assert_eq!(m1.len(), 1);
        assert_eq!(m1[0].method(), Some("OPTIONS"));
        assert_eq!(m1[0].uri(), Some("*"));
        assert_eq!(m1[0].header_value("Require"), Some("org.wfa.wfd1.0"));
        assert_eq!(s.state(), SessionState::CapsExchanging);

        s.feed_bytes(
            &reply_ok(
                &m1[0],
                &[(
                    "Public",
                    "org.wfa.wfd1.0, GET_PARAMETER, SET_PARAMETER, SETUP, PLAY, PAUSE, TEARDOWN",
                )],
                None,
            ),
            now,
        );

        // M3 follows immediately.
        let m3 = wire_messages(s);
        assert_eq!(m3.len(), 1);
        assert_eq!(m3[0].method(), Some("GET_PARAMETER"));
        assert_eq!(m3[0].uri(), Some("rtsp://localhost/wfd1.0"));
        assert!(m3[0].body_param("wfd_video_formats").is_some());
        assert!(m3[0].body_param("wfd_client_rtp_ports").is_some());

        s.feed_bytes(
            &reply_ok(
                &m3[0],
                &[],
                Some(
                    "wfd_video_formats: 40 00 02 10 0001DEFF 051557FF 00000FFF 00 0000 0000 11 none none\n\
                     wfd_audio_codecs: LPCM 00000003 00\n\
                     wfd_client_rtp_ports: RTP/AVP/UDP;unicast 1991 0 mode=play",
                ),
            ),
            now,
        );

        // M4 carries our selection and the echoed client ports.
        let m4 = wire_messages(s);
        assert_eq!(m4.len(), 1);
        assert_eq!(m4[0].method(), Some("SET_PARAMETER"));
        assert_eq!(
            m4[0].body_param("wfd_client_rtp_ports"),
            Some("RTP/AVP/UDP;unicast 1991 0 mode=play")
        );
        assert_eq!(
            m4[0].body_param("wfd_presentation_URL"),
            Some("rtsp://192.168.77.1/wfd1.0/streamid=0 none")
        );
        assert!(s.state() < SessionState::Established);

        s.feed_bytes(&reply_ok(&m4[0], &[], None), now);
        assert_eq!(s.state(), SessionState::Established);
    }

    #[test]
    fn source_caps_exchange_happy_path() {
        // Seed scenario 2.
        let now = Instant::now();
        let mut s = out_session();
        drive_to_established(&mut s, now);

        assert_eq!(s.rtp_ports, (1991, 0));
        assert!(s.vformats.is_some());
        assert!(s.acodecs.is_some());

        // Established triggers M5 SETUP.
        let m5 = wire_messages(&mut s);
        assert_eq!(m5.len(), 1);
        assert_eq!(m5[0].method(), Some("SET_PARAMETER"));
        assert_eq!(m5[0].uri(), Some("rtsp://192.168.77.1/wfd1.0/streamid=0"));
        assert_eq!(m5[0].body_param("wfd_trigger_method"), Some("SETUP"));

        let events = s.drain_events();
        assert!(events.contains(&WfdEvent::StateChanged {
            session: 0x2A,
            state: SessionState::Established
        }));
    }

    #[test]
    fn setup_reply_carries_session_and_server_ports() {
        // Seed scenario 3.
        let now = Instant::now();
        let mut s = out_session();
        drive_to_established(&mut s, now);
        let m5 = wire_messages(&mut s);
        s.feed_bytes(&reply_ok(&m5[0], &[], None), now);

        let setup = "SETUP rtsp://192.168.77.1/wfd1.0/streamid=0 RTSP/1.0\r\n\
                     CSeq: 1\r\n\
                     Transport: RTP/AVP/UDP;unicast;client_port=1991-1992\r\n\r\n";
        s.feed_bytes(setup.as_bytes(), now);

        let rep = wire_messages(&mut s);
        assert_eq!(rep.len(), 1);
        assert!(rep[0].is_reply_code(200));
        assert_eq!(
            rep[0].header_value("Session"),
            Some("2A;timeout=30")
        );
        assert_eq!(
            rep[0].header_value("Transport"),
            Some("RTP/AVP/UDP;unicast;client_port=1991-1992;server_port=16384-16385")
        );
        assert!(rep[0].header_value("Date").is_some());
        assert_eq!(rep[0].wire_cookie(), 1);

        assert_eq!(s.state(), SessionState::SettingUp);
        assert_eq!(s.stream.rtp_port, 1991);
        assert_eq!(s.stream.rtcp_port, 1992);
        assert!(s.keep_alive_deadline().is_some());
    }

    #[test]
    fn keep_alive_is_a_bodyless_get_parameter_with_session() {
        // Seed scenario 4.
        let now = Instant::now();
        let mut s = out_session();
        drive_to_established(&mut s, now);
        let m5 = wire_messages(&mut s);
        s.feed_bytes(&reply_ok(&m5[0], &[], None), now);

        s.arm_keep_alive(now);
        let due = s.keep_alive_deadline().expect("armed");
        assert_eq!(due - now, Duration::from_secs(25));

        s.on_tick(due);
        let m16 = wire_messages(&mut s);
        assert_eq!(m16.len(), 1);
        assert_eq!(m16[0].method(), Some("GET_PARAMETER"));
        assert_eq!(m16[0].header_value("Session"), Some("2A"));
        assert!(m16[0].body().is_empty());

        // The 200 answer re-arms the timer.
        s.feed_bytes(&reply_ok(&m16[0], &[], None), due);
        let rearmed = s.keep_alive_deadline().expect("re-armed");
        assert_eq!(rearmed - due, Duration::from_secs(25));
    }

    #[test]
    fn play_and_teardown_round() {
        let now = Instant::now();
        let mut s = out_session();
        drive_to_established(&mut s, now);
        let m5 = wire_messages(&mut s);
        s.feed_bytes(&reply_ok(&m5[0], &[], None), now);

        s.feed_bytes(
            b"PLAY rtsp://192.168.77.1/wfd1.0/streamid=0 RTSP/1.0\r\nCSeq: 5\r\n\r\n",
            now,
        );
        let rep = wire_messages(&mut s);
        assert_eq!(rep.len(), 1);
        assert!(rep[0].is_reply_code(200));
        assert_eq!(rep[0].header_value("Session"), Some("2A"));

        // Without an encoder the state advances only on its events.
        s.on_encoder_state(EncoderState::Started, now);
        assert_eq!(s.state(), SessionState::Playing);
        s.drain_events();

        s.feed_bytes(
            b"TEARDOWN rtsp://192.168.77.1/wfd1.0/streamid=0 RTSP/1.0\r\nCSeq: 6\r\n\r\n",
            now,
        );
        let rep = wire_messages(&mut s);
        assert!(rep[0].is_reply_code(200));
        assert_eq!(s.state(), SessionState::TearingDown);
        assert!(s.drain_events().contains(&WfdEvent::Ended { session: 0x2A }));
    }

    #[test]
    fn idr_request_leaves_state_unchanged() {
        let now = Instant::now();
        let mut s = out_session();
        drive_to_established(&mut s, now);
        let m5 = wire_messages(&mut s);
        s.feed_bytes(&reply_ok(&m5[0], &[], None), now);

        let before = s.state();
        let idr = "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n\
                   CSeq: 7\r\n\
                   Content-Type: text/parameters\r\n\
                   Content-Length: 15\r\n\r\n\
                   wfd_idr_request";
        s.feed_bytes(idr.as_bytes(), now);

        let rep = wire_messages(&mut s);
        assert_eq!(rep.len(), 1);
        assert!(rep[0].is_reply_code(200));
        assert_eq!(s.state(), before);
    }

    #[test]
    fn unsupported_set_parameters_get_501() {
        let now = Instant::now();
        let mut s = out_session();
        drive_to_established(&mut s, now);
        let m5 = wire_messages(&mut s);
        s.feed_bytes(&reply_ok(&m5[0], &[], None), now);

        let body = "wfd_uibc_setting: enable";
        let uibc = format!(
            "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n\
             CSeq: 8\r\n\
             Content-Type: text/parameters\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        s.feed_bytes(uibc.as_bytes(), now);

        let rep = wire_messages(&mut s);
        assert_eq!(rep.len(), 1);
        assert!(rep[0].is_reply_code(501));
    }

    #[test]
    fn sink_options_do_not_duplicate_the_capability_query() {
        let now = Instant::now();
        let mut s = out_session();
        s.start_caps_exchange(now).expect("starts");
        let m1 = wire_messages(&mut s);
        s.feed_bytes(
            &reply_ok(
                &m1[0],
                &[("Public", "org.wfa.wfd1.0, GET_PARAMETER, SET_PARAMETER")],
                None,
            ),
            now,
        );
        let m3 = wire_messages(&mut s);
        assert_eq!(m3.len(), 1);
        assert_eq!(m3[0].method(), Some("GET_PARAMETER"));

        // The sink's own OPTIONS probe answers 200 but must not chain a
        // second M3.
        s.feed_bytes(
            b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.wfa.wfd1.0\r\n\r\n",
            now,
        );
        let rep = wire_messages(&mut s);
        assert_eq!(rep.len(), 1);
        assert!(rep[0].is_reply_code(200));
        assert_eq!(
            rep[0].header_value("Public"),
            Some(super::PUBLIC_METHODS)
        );
    }

    #[test]
    fn foreign_options_requirement_is_rejected() {
        let now = Instant::now();
        let mut s = out_session();
        s.start_caps_exchange(now).expect("starts");
        let _m1 = wire_messages(&mut s);

        s.feed_bytes(
            b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.example.other\r\n\r\n",
            now,
        );
        // The post-rule still chains M3; the rejection itself is the
        // first wire message.
        let rep = wire_messages(&mut s);
        assert_eq!(rep.len(), 2);
        assert!(rep[0].is_reply_code(551));
        assert_eq!(rep[1].method(), Some("GET_PARAMETER"));
    }

    #[test]
    fn peer_rejection_terminates_session() {
        let now = Instant::now();
        let mut s = out_session();
        s.start_caps_exchange(now).expect("starts");
        let m1 = wire_messages(&mut s);

        let nack = format!(
            "RTSP/1.0 455 Method Not Valid In This State\r\nCSeq: {}\r\n\r\n",
            m1[0].wire_cookie()
        );
        s.feed_bytes(nack.as_bytes(), now);

        assert_eq!(s.state(), SessionState::Terminating);
        assert!(s
            .drain_events()
            .iter()
            .any(|e| matches!(e, WfdEvent::Error { .. })));

        // Invariant: no further operations once terminated.
        assert!(s.teardown(now).is_err());
        assert!(s.resume(now).is_err());
    }
}
