//! The Miracast session state machine.
//!
//! A session owns one RTSP bus and a role-specific dispatch table.
//! Incoming messages are classified into M1–M16 by method and body,
//! handled by the table entry, answered with a dated reply, and the
//! entry's post-rules advance the state and chain the next request of
//! the sequence. Replies to our own requests route through the entry of
//! `last_request`; anything but 200 tears the session down.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::encoder::{Encoder, EncoderConfig, EncoderIo, EncoderState};
use crate::log::LogSink;
use crate::rtsp::{BusEvent, MatchChain, MatchResult, Message, RtspBus};
use crate::wfd::dispatch::{DispatchTable, MessageId, Rule, TriggerMethod};
use crate::wfd::formats::{AudioCodecs, VideoFormats};
use crate::wfd::wfd_error::WfdError;
use crate::{sink_debug, sink_warn};

/// Local RTP/RTCP endpoints of the outgoing stream.
pub const LOCAL_RTP_PORT: u16 = 16384;
pub const LOCAL_RTCP_PORT: u16 = 16385;

/// Timeout advertised in the M6 reply's Session header.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Safety margin: two successive keep-alives must be closer than the
/// session timeout minus five seconds.
pub const KEEP_ALIVE_SAFETY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDir {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Null,
    Connecting,
    CapsExchanging,
    Established,
    SettingUp,
    Playing,
    Paused,
    TearingDown,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Primary = 0,
    Secondary = 1,
}

#[derive(Debug, Default)]
pub struct StreamInfo {
    pub url: Option<String>,
    /// Peer's chosen RTP/RTCP ports from the SETUP transport line.
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// Facade-bound session events, drained by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WfdEvent {
    StateChanged { session: u32, state: SessionState },
    Ended { session: u32 },
    Error { session: u32, reason: String },
}

pub struct WfdSession {
    id: u32,
    dir: SessionDir,
    state: SessionState,
    table: &'static DispatchTable,
    pub(crate) bus: Option<RtspBus>,
    last_request: Option<MessageId>,
    /// The capability query is chained from both sides' OPTIONS
    /// exchanges; whichever completes first issues it, exactly once.
    caps_queried: bool,

    /// Sink's RTP/RTCP ports from the M3 `wfd_client_rtp_ports` answer.
    pub(crate) rtp_ports: (u16, u16),
    pub(crate) vformats: Option<VideoFormats>,
    pub(crate) acodecs: Option<AudioCodecs>,
    pub(crate) stream: StreamInfo,

    /// Our IPv4 on the P2P group; the RTSP listener and stream source.
    pub(crate) local_addr: String,
    pub(crate) peer_addr: Option<String>,
    /// Port from the peer's Device Info sub-element (Source role).
    pub(crate) rtsp_port: u16,

    /// Display/audio endpoints handed to the encoder.
    pub(crate) disp_name: Option<String>,
    pub(crate) audio_dev: Option<String>,

    keep_alive: Option<Instant>,
    session_timeout: Duration,

    /// Unsolicited-message handlers of the attached transport.
    chain: MatchChain<WfdSession>,
    /// Loop time of the event currently dispatching; handlers in the
    /// chain read it instead of sampling the clock.
    clock: Instant,

    pub(crate) encoder: Option<Encoder>,
    out: VecDeque<WfdEvent>,
    pub(crate) log: Arc<dyn LogSink>,
}

impl WfdSession {
    pub(crate) fn new(
        id: u32,
        dir: SessionDir,
        table: &'static DispatchTable,
        local_addr: String,
        rtsp_port: u16,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            id,
            dir,
            state: SessionState::Null,
            table,
            bus: None,
            last_request: None,
            caps_queried: false,
            rtp_ports: (0, 0),
            vformats: None,
            acodecs: None,
            stream: StreamInfo::default(),
            local_addr,
            peer_addr: None,
            rtsp_port,
            disp_name: None,
            audio_dev: None,
            keep_alive: None,
            session_timeout: SESSION_TIMEOUT,
            chain: MatchChain::new(),
            clock: Instant::now(),
            encoder: None,
            out: VecDeque::new(),
            log,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn dir(&self) -> SessionDir {
        self.dir
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Established and beyond, teardown included.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state >= SessionState::Established && self.state != SessionState::Terminating
    }

    /// The id of the in-flight (or last issued) outgoing request.
    #[must_use]
    pub fn last_request(&self) -> Option<MessageId> {
        self.last_request
    }

    pub fn set_encoder(&mut self, encoder: Encoder) {
        self.encoder = Some(encoder);
    }

    pub fn set_peer_addr(&mut self, addr: &str) {
        self.peer_addr = Some(addr.to_string());
    }

    pub fn set_display(&mut self, name: Option<String>, audio_dev: Option<String>) {
        self.disp_name = name;
        self.audio_dev = audio_dev;
    }

    pub fn drain_events(&mut self) -> Vec<WfdEvent> {
        self.out.drain(..).collect()
    }

    // ---- Transport ---------------------------------------------------

    /// Attach a fresh bus; the owner pumps raw bytes in and wire buffers
    /// out. The session registers itself for unsolicited messages.
    pub fn attach_transport(&mut self) {
        self.bus = Some(RtspBus::new());
        self.chain = MatchChain::new();
        self.chain.add(Self::on_rtsp_message);
    }

    /// Transport match handler: requests, data frames and unknown heads
    /// land here; `None` is the HUP notification.
    fn on_rtsp_message(s: &mut WfdSession, m: Option<&Message>) -> MatchResult {
        let now = s.clock;
        match m {
            Some(m) => s.handle_incoming(m, now),
            None => s.error_terminate("transport closed", now),
        }
        MatchResult::Handled
    }

    fn dispatch_chain(&mut self, m: Option<&Message>) {
        let mut chain = std::mem::take(&mut self.chain);
        chain.dispatch(self, m);
        // terminate() clears the handlers; do not resurrect them.
        if self.state != SessionState::Terminating {
            self.chain = chain;
        }
    }

    /// Connection is up; exchange capabilities, starting with M1.
    ///
    /// # Errors
    /// Propagates build/transport failures of the first request.
    pub fn start_caps_exchange(&mut self, now: Instant) -> Result<(), WfdError> {
        self.set_state(SessionState::CapsExchanging);
        self.request(MessageId::M1RequestSinkOptions, None, now)
    }

    /// Feed received bytes, then run all resulting dispatch.
    pub fn feed_bytes(&mut self, data: &[u8], now: Instant) {
        if let Some(bus) = self.bus.as_mut()
            && bus.feed(data).is_err()
        {
            bus.hup();
        }
        self.process(now);
    }

    /// The transport reader saw EOF or an error.
    pub fn transport_hup(&mut self, now: Instant) {
        if let Some(bus) = self.bus.as_mut() {
            bus.hup();
        }
        self.process(now);
    }

    /// Sealed wire buffers waiting for the writer thread.
    pub fn take_wire(&mut self) -> Vec<Bytes> {
        let mut v = Vec::new();
        if let Some(bus) = self.bus.as_mut() {
            while let Some(raw) = bus.take_outgoing() {
                v.push(raw);
            }
        }
        v
    }

    /// Drain and dispatch every due bus event.
    pub fn process(&mut self, now: Instant) {
        self.clock = now;
        loop {
            let Some(bus) = self.bus.as_mut() else { return };
            let Some(ev) = bus.poll_event(now) else { return };
            match ev {
                BusEvent::Incoming(m) => self.dispatch_chain(Some(&m)),
                BusEvent::Reply { msg, .. } => self.handle_reply_msg(&msg, now),
                BusEvent::Timeout { .. } => {
                    self.error_terminate("request timed out", now);
                }
                BusEvent::Aborted { .. } => {
                    self.error_terminate("request aborted", now);
                }
                BusEvent::Hup => self.dispatch_chain(None),
            }
        }
    }

    // ---- Dispatch ----------------------------------------------------

    /// Map an incoming message to its exchange step.
    fn message_to_id(&self, m: &Message) -> Option<MessageId> {
        use MessageId::*;

        let method = m.method()?;
        match method {
            "SET_PARAMETER" => {
                if m.body_param("wfd_trigger_method").is_some() {
                    Some(M5Trigger)
                } else if m.body_param("wfd_route").is_some() {
                    Some(M10SetRoute)
                } else if m.body_param("wfd_connector_type").is_some() {
                    Some(M11SetConnectorType)
                } else if m.body_param("wfd_uibc_setting").is_some() {
                    Some(M15EnableUibc)
                } else if m.body().starts_with(b"wfd_standby") {
                    Some(M12SetStandby)
                } else if m.body().starts_with(b"wfd_idr_request") {
                    Some(M13RequestIdr)
                } else if self.state == SessionState::CapsExchanging {
                    Some(M4SetParameter)
                } else if m.body_param("wfd_uibc_capability").is_some() {
                    Some(M14EstablishUibc)
                } else {
                    None
                }
            }
            "OPTIONS" => Some(match self.dir {
                SessionDir::Out => M2RequestSrcOptions,
                SessionDir::In => M1RequestSinkOptions,
            }),
            "GET_PARAMETER" => {
                if m.body().is_empty() {
                    Some(M16KeepAlive)
                } else {
                    Some(M3GetParameter)
                }
            }
            "SETUP" => Some(M6Setup),
            "PLAY" => Some(M7Play),
            "TEARDOWN" => Some(M8Teardown),
            "PAUSE" => Some(M9Pause),
            _ => None,
        }
    }

    /// Build and send the request for `id`, awaiting its reply.
    ///
    /// # Errors
    /// Unimplemented builder, build failure, or a dead transport.
    pub fn request(
        &mut self,
        id: MessageId,
        args: Option<TriggerMethod>,
        now: Instant,
    ) -> Result<(), WfdError> {
        if self.state == SessionState::Terminating {
            return Err(WfdError::InvalidState("session terminated"));
        }
        if id == MessageId::M3GetParameter {
            if self.caps_queried {
                return Ok(());
            }
            self.caps_queried = true;
        }
        let entry = &self.table[id.index()];
        let Some(builder) = entry.request else {
            sink_warn!(self.log, "request {} not implemented", id);
            return Err(WfdError::Protocol("request not implemented"));
        };

        let m = builder(self, args)?;
        let bus = self
            .bus
            .as_mut()
            .ok_or(WfdError::InvalidState("no transport"))?;
        bus.call(m, None, now)?;
        self.last_request = Some(id);
        sink_debug!(self.log, "session {:X}: sent {} request", self.id, id);
        Ok(())
    }

    fn handle_incoming(&mut self, m: &Message, now: Instant) {
        let Some(id) = self.message_to_id(m) else {
            sink_debug!(self.log, "session {:X}: unclassifiable message", self.id);
            self.error_terminate("unexpected message", now);
            return;
        };
        sink_debug!(self.log, "session {:X}: received {} request", self.id, id);

        let entry = &self.table[id.index()];
        let Some(handler) = entry.handle_request else {
            sink_warn!(self.log, "request handler not implemented for {}", id);
            self.error_terminate("unhandled request", now);
            return;
        };

        let result = handler(self, m)
            .and_then(|mut rep| {
                rep.append_header("Date", rfc1123_now())
                    .map_err(WfdError::from)?;
                let bus = self
                    .bus
                    .as_mut()
                    .ok_or(WfdError::InvalidState("no transport"))?;
                bus.send(rep).map_err(WfdError::from)?;
                Ok(())
            })
            .and_then(|()| self.apply_rules(id, now));

        if let Err(e) = result {
            sink_warn!(self.log, "session {:X}: {} failed: {}", self.id, id, e);
            self.error_terminate("protocol error", now);
        }
    }

    fn handle_reply_msg(&mut self, m: &Message, now: Instant) {
        if !m.is_reply_code(crate::rtsp::status::OK) {
            self.error_terminate("peer rejected request", now);
            return;
        }
        let Some(id) = self.last_request else { return };
        sink_debug!(self.log, "session {:X}: received {} reply", self.id, id);

        if let Some(f) = self.table[id.index()].handle_reply
            && let Err(e) = f(self, m)
        {
            sink_warn!(self.log, "session {:X}: {} reply failed: {}", self.id, id, e);
            self.error_terminate("protocol error", now);
            return;
        }

        // A keep-alive answer proves liveness and re-arms the timer.
        if id == MessageId::M16KeepAlive {
            self.arm_keep_alive(now);
        }

        if self.apply_rules(id, now).is_err() {
            self.error_terminate("protocol error", now);
        }
    }

    fn apply_rules(&mut self, id: MessageId, now: Instant) -> Result<(), WfdError> {
        let mut next = None;
        let mut args = None;
        let mut new_state = None;

        for rule in self.table[id.index()].rules {
            match *rule {
                Rule::NewState(s) => new_state = Some(s),
                Rule::NextRequest(n) => next = Some(n),
                Rule::RequestArgs(a) => args = Some(a),
            }
        }

        if let Some(s) = new_state {
            self.set_state(s);
        }

        if let Some(n) = next {
            return self.request(n, args, now);
        }

        if new_state == Some(SessionState::TearingDown) {
            self.out.push_back(WfdEvent::Ended { session: self.id });
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.out.push_back(WfdEvent::StateChanged {
            session: self.id,
            state,
        });
    }

    // ---- Stream control ----------------------------------------------

    /// # Errors
    /// `InvalidState` unless the session is paused (playing is a no-op).
    pub fn resume(&mut self, now: Instant) -> Result<(), WfdError> {
        match self.state {
            SessionState::Playing => Ok(()),
            SessionState::Paused => {
                self.request(MessageId::M5Trigger, Some(TriggerMethod::Play), now)
            }
            _ => Err(WfdError::InvalidState("session is not paused")),
        }
    }

    /// # Errors
    /// `InvalidState` unless the session is playing (paused is a no-op).
    pub fn pause(&mut self, now: Instant) -> Result<(), WfdError> {
        match self.state {
            SessionState::Paused => Ok(()),
            SessionState::Playing => {
                self.request(MessageId::M5Trigger, Some(TriggerMethod::Pause), now)
            }
            _ => Err(WfdError::InvalidState("session is not playing")),
        }
    }

    /// Orderly shutdown: trigger TEARDOWN when established, otherwise
    /// terminate on the spot.
    ///
    /// # Errors
    /// `InvalidState` after termination.
    pub fn teardown(&mut self, now: Instant) -> Result<(), WfdError> {
        if self.state == SessionState::Terminating {
            return Err(WfdError::InvalidState("session terminated"));
        }
        if self.is_established() {
            self.request(MessageId::M5Trigger, Some(TriggerMethod::Teardown), now)
        } else {
            self.terminate(now);
            self.out.push_back(WfdEvent::Ended { session: self.id });
            Ok(())
        }
    }

    /// Drop the transport and every negotiated resource. No dispatch
    /// callback fires afterwards.
    pub fn terminate(&mut self, now: Instant) {
        if let Some(enc) = self.encoder.as_mut() {
            enc.stop(now);
        }

        self.bus = None;
        self.vformats = None;
        self.acodecs = None;
        self.stream.url = None;
        self.stream.rtp_port = 0;
        self.stream.rtcp_port = 0;
        self.rtp_ports = (0, 0);
        self.disp_name = None;
        self.audio_dev = None;
        self.last_request = None;
        self.caps_queried = false;
        self.keep_alive = None;
        self.chain = MatchChain::new();

        self.set_state(SessionState::Terminating);
    }

    fn error_terminate(&mut self, reason: &str, now: Instant) {
        self.out.push_back(WfdEvent::Error {
            session: self.id,
            reason: reason.to_string(),
        });
        self.terminate(now);
    }

    // ---- Keep-alive & timers -----------------------------------------

    pub(crate) fn arm_keep_alive(&mut self, now: Instant) {
        let interval = self.session_timeout.saturating_sub(KEEP_ALIVE_SAFETY);
        self.keep_alive = Some(now + interval);
    }

    #[must_use]
    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.keep_alive
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut min = self.keep_alive;
        if let Some(d) = self.bus.as_ref().and_then(RtspBus::next_deadline) {
            min = Some(min.map_or(d, |m| m.min(d)));
        }
        if let Some(d) = self.encoder.as_ref().and_then(Encoder::next_deadline) {
            min = Some(min.map_or(d, |m| m.min(d)));
        }
        min
    }

    /// Fire due timers: keep-alive and the encoder terminator.
    pub fn on_tick(&mut self, now: Instant) {
        if self.keep_alive.is_some_and(|d| d <= now) {
            self.keep_alive = None;
            if self.request(MessageId::M16KeepAlive, None, now).is_ok() {
                self.arm_keep_alive(now);
            }
        }

        if let Some(enc) = self.encoder.as_mut()
            && let Some(state) = enc.on_tick(now)
        {
            self.on_encoder_state(state, now);
        }
    }

    // ---- Encoder observer --------------------------------------------

    /// Route one encoder I/O event into the state observer.
    pub fn handle_encoder_io(&mut self, io: EncoderIo, now: Instant) {
        if let Some(enc) = self.encoder.as_mut()
            && let Some(state) = enc.handle_io(io, now)
        {
            self.on_encoder_state(state, now);
        }
    }

    pub(crate) fn on_encoder_state(&mut self, state: EncoderState, now: Instant) {
        match state {
            EncoderState::Spawned => {
                if self.state == SessionState::SettingUp {
                    let cfg = self.encoder_config();
                    if let Some(enc) = self.encoder.as_mut()
                        && enc.configure(&cfg).is_err()
                    {
                        sink_warn!(self.log, "session {:X}: encoder configure failed", self.id);
                    }
                }
            }
            EncoderState::Configured => {
                if self.state == SessionState::SettingUp
                    && let Some(enc) = self.encoder.as_mut()
                    && enc.start().is_err()
                {
                    sink_warn!(self.log, "session {:X}: encoder start failed", self.id);
                }
            }
            EncoderState::Started => self.set_state(SessionState::Playing),
            EncoderState::Paused => self.set_state(SessionState::Paused),
            EncoderState::Terminated => {
                let _ = self.teardown(now);
            }
            EncoderState::Null | EncoderState::Ready => {}
        }
    }

    pub(crate) fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            local_address: Some(self.local_addr.clone()),
            peer_address: self.peer_addr.clone(),
            rtp_port0: self.stream.rtp_port,
            rtp_port1: self.stream.rtcp_port,
            local_rtp_port: LOCAL_RTP_PORT,
            local_rtcp_port: LOCAL_RTCP_PORT,
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            audio_dev: self.audio_dev.clone(),
        }
    }

    pub(crate) fn gen_stream_url(&mut self, id: StreamId) {
        self.stream.url = Some(format!(
            "rtsp://{}/wfd1.0/streamid={}",
            self.local_addr, id as u8
        ));
    }
}

/// `Date:` header value, RFC-1123 in GMT.
fn rfc1123_now() -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    match crate::log::logger::unix_to_utc(secs) {
        Some(tm) if (1..=12).contains(&tm.mon) && tm.weekday < 7 => format!(
            "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
            DAYS[tm.weekday as usize],
            tm.day,
            MONTHS[(tm.mon - 1) as usize],
            tm.year,
            tm.hour,
            tm.min,
            tm.sec
        ),
        _ => "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_interval_stays_under_timeout_margin() {
        let interval = SESSION_TIMEOUT.saturating_sub(KEEP_ALIVE_SAFETY);
        assert_eq!(interval, Duration::from_secs(25));
        assert!(interval <= SESSION_TIMEOUT - Duration::from_secs(5));
    }

    #[test]
    fn state_order_follows_lifecycle() {
        assert!(SessionState::Connecting < SessionState::CapsExchanging);
        assert!(SessionState::CapsExchanging < SessionState::Established);
        assert!(SessionState::Established < SessionState::SettingUp);
        assert!(SessionState::TearingDown < SessionState::Terminating);
    }

    #[test]
    fn rfc1123_renders_gmt() {
        let d = rfc1123_now();
        assert!(d.ends_with(" GMT"));
        assert_eq!(d.matches(':').count(), 2);
        assert!(d.contains(", "));
    }
}
