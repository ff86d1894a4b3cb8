//! Process-wide state and the central event loop.
//!
//! The manager owns every link (with its supplicant) and every session;
//! worker threads reach it through one event channel. Each loop turn
//! sleeps until the nearest deadline of any subsystem, dispatches due
//! events, fires due timers, then drains the facade queues.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::events::ManagerEvent;
use crate::encoder::{Encoder, EncoderIo};
use crate::log::{LogLevel, LogSink};
use crate::rtsp::connection::{ConnEvent, ConnWriter, spawn_connection_threads};
use crate::wfd::session::{SessionState, WfdEvent, WfdSession};
use crate::wfd::sink::WfdSink;
use crate::wfd::wfd_error::WfdError;
use crate::wifi::events::WifiEvent;
use crate::wifi::link::Link;
use crate::wifi::supplicant::{Supplicant, SupplicantConfig, WifiIoEvent};
use crate::{sink_debug, sink_error, sink_info, sink_warn};

/// Idle tick when nothing has a deadline.
const IDLE_TICK: Duration = Duration::from_millis(500);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

struct SessionHandle {
    session: WfdSession,
    link: u32,
    writer: Option<ConnWriter>,
}

pub struct Manager {
    cfg: Arc<Config>,
    log: Arc<dyn LogSink>,

    links: HashMap<u32, Supplicant>,
    sinks: HashMap<String, WfdSink>,
    sessions: HashMap<u32, SessionHandle>,
    /// Monotonic; session ids are never reused within the process.
    next_session_id: u32,

    tx: mpsc::Sender<ManagerEvent>,
    rx: mpsc::Receiver<ManagerEvent>,
    wifi_tx: mpsc::Sender<WifiIoEvent>,
    enc_tx: mpsc::Sender<(u32, EncoderIo)>,
}

impl Manager {
    #[must_use]
    pub fn new(cfg: Arc<Config>, log: Arc<dyn LogSink>) -> Self {
        let (tx, rx) = mpsc::channel();

        // Subsystem channels are folded into the main one by small
        // forwarder threads, so every reader thread stays decoupled
        // from the manager's event type.
        let (wifi_tx, wifi_rx) = mpsc::channel::<WifiIoEvent>();
        {
            let tx = tx.clone();
            thread::spawn(move || {
                while let Ok(ev) = wifi_rx.recv() {
                    if tx.send(ManagerEvent::Wifi(ev)).is_err() {
                        break;
                    }
                }
            });
        }

        let (enc_tx, enc_rx) = mpsc::channel::<(u32, EncoderIo)>();
        {
            let tx = tx.clone();
            thread::spawn(move || {
                while let Ok((session, io)) = enc_rx.recv() {
                    if tx.send(ManagerEvent::Encoder { session, io }).is_err() {
                        break;
                    }
                }
            });
        }

        Self {
            cfg,
            log,
            links: HashMap::new(),
            sinks: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 0,
            tx,
            rx,
            wifi_tx,
            enc_tx,
        }
    }

    fn supplicant_config(&self) -> SupplicantConfig {
        SupplicantConfig {
            ctrl_dir: self
                .cfg
                .get_or_default("Wifi", "ctrl_dir", "/run/miracle/wifi")
                .into(),
            wpas_binary: self
                .cfg
                .get_or_default("Wifi", "wpas_binary", "wpa_supplicant")
                .to_string(),
            dhcp_binary: self
                .cfg
                .get_or_default("Wifi", "dhcp_binary", "rustycast-dhcp")
                .to_string(),
            log_level: LogLevel::Info,
        }
    }

    /// Take a radio interface under management and bring its supplicant
    /// up.
    ///
    /// # Errors
    /// `Already` for a managed ifindex; spawn failures.
    pub fn add_link(&mut self, ifindex: u32, ifname: &str, now: Instant) -> Result<(), WfdError> {
        if self.links.contains_key(&ifindex) {
            return Err(WfdError::Already);
        }

        let mut link = Link::new(ifindex, ifname);
        link.friendly_name = self
            .cfg
            .get_non_empty("Wfd", "friendly_name")
            .map(str::to_string);
        link.config_methods = self
            .cfg
            .get_non_empty("Wifi", "config_methods")
            .map(str::to_string);
        link.managed = true;

        let mut supplicant = Supplicant::new(
            link,
            self.supplicant_config(),
            self.log.clone(),
            self.wifi_tx.clone(),
        );
        supplicant.start(now)?;

        sink_info!(self.log, "managing link {} ({})", ifname, ifindex);
        self.links.insert(ifindex, supplicant);
        Ok(())
    }

    /// Release a link: tear down its sessions and stop the supplicant.
    pub fn remove_link(&mut self, ifindex: u32, now: Instant) {
        let session_ids: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, h)| h.link == ifindex)
            .map(|(id, _)| *id)
            .collect();
        for id in session_ids {
            self.destroy_session(id, now);
        }
        self.sinks.retain(|_, s| s.link != ifindex);

        if let Some(mut s) = self.links.remove(&ifindex) {
            s.stop();
            sink_info!(self.log, "released link {}", ifindex);
        }
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    // ---- Sessions ----------------------------------------------------

    /// Start a Source session towards a connected sink peer.
    ///
    /// # Errors
    /// `Already` when the link has a session; `InvalidState` for
    /// unknown/unconnected peers or missing sub-elements.
    pub fn start_session(
        &mut self,
        link: u32,
        peer_mac: &str,
        now: Instant,
    ) -> Result<u32, WfdError> {
        // One active session per link, across all of its peers.
        if self.sessions.values().any(|h| h.link == link) {
            return Err(WfdError::Already);
        }

        let supplicant = self
            .links
            .get(&link)
            .ok_or(WfdError::InvalidState("unknown link"))?;
        let peer = supplicant
            .link()
            .peer(peer_mac)
            .ok_or(WfdError::InvalidState("unknown peer"))?;
        if !peer.connected {
            return Err(WfdError::InvalidState("peer not connected"));
        }

        let subelements = peer
            .wfd_subelements
            .clone()
            .ok_or(WfdError::InvalidState("peer has no WFD sub-elements"))?;
        let remote_addr = peer
            .remote_addr
            .clone()
            .ok_or(WfdError::InvalidState("peer has no address"))?;
        let group = peer
            .group
            .clone()
            .ok_or(WfdError::InvalidState("peer has no group"))?;
        let local_addr = supplicant
            .group(&group)
            .and_then(|g| g.local_addr.clone())
            .ok_or(WfdError::InvalidState("group has no local address"))?;

        let mut sink = WfdSink::from_subelements(link, &peer.p2p_mac, &subelements)?;

        self.next_session_id += 1;
        let id = self.next_session_id;
        sink.claim_session(id)?;

        let mut session =
            WfdSession::new_out(id, &local_addr, sink.dev_info.rtsp_port, self.log.clone());
        session.set_peer_addr(&remote_addr);
        session.set_display(
            self.cfg.get_non_empty("Encoder", "display").map(str::to_string),
            self.cfg
                .get_non_empty("Encoder", "audio_dev")
                .map(str::to_string),
        );

        let listener = session.initiate_io()?;
        self.spawn_accept_thread(id, listener);

        match Encoder::spawn(
            id,
            self.cfg
                .get_or_default("Encoder", "encoder_binary", "rustycast-encoder"),
            self.enc_tx.clone(),
        ) {
            Ok(enc) => session.set_encoder(enc),
            Err(e) => sink_warn!(self.log, "session {:X}: no encoder: {}", id, e),
        }

        sink_info!(
            self.log,
            "session {:X} listening on {}:{} for {}",
            id,
            local_addr,
            sink.dev_info.rtsp_port,
            sink.label()
        );

        self.sinks.insert(sink.label(), sink);
        self.sessions.insert(id, SessionHandle {
            session,
            link,
            writer: None,
        });
        Ok(id)
    }

    fn spawn_accept_thread(&self, id: u32, listener: TcpListener) {
        let tx = self.tx.clone();
        thread::spawn(move || {
            if let Ok((stream, _addr)) = listener.accept() {
                let _ = tx.send(ManagerEvent::SessionAccept {
                    session: id,
                    stream,
                });
            }
        });
    }

    fn destroy_session(&mut self, id: u32, now: Instant) {
        if let Some(mut h) = self.sessions.remove(&id) {
            h.session.terminate(now);
            if let Some(w) = &h.writer {
                w.shutdown();
            }
            for ev in h.session.drain_events() {
                self.log_wfd_event(&ev);
            }
        }
        for sink in self.sinks.values_mut() {
            if sink.session == Some(id) {
                sink.release_session();
            }
        }
    }

    // ---- Event loop --------------------------------------------------

    /// Install handlers for the termination signals. SIGCHLD needs no
    /// handler: children are owned and reaped by their supervisors.
    pub fn install_signal_handlers() {
        let handler = on_term_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
            libc::signal(libc::SIGHUP, handler);
            libc::signal(libc::SIGQUIT, handler);
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    }

    /// A cloneable injector, mainly for the facade and tests.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<ManagerEvent> {
        self.tx.clone()
    }

    /// Run until shutdown. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        sink_info!(self.log, "manager running with {} links", self.links.len());

        loop {
            if SHUTDOWN.load(Ordering::Relaxed) {
                break;
            }

            let now = Instant::now();
            let timeout = self
                .next_deadline()
                .map_or(IDLE_TICK, |d| d.saturating_duration_since(now).min(IDLE_TICK));

            match self.rx.recv_timeout(timeout) {
                Ok(ManagerEvent::Shutdown) => break,
                Ok(ev) => self.dispatch(ev),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            self.tick(Instant::now());
            self.drain_facade();
        }

        sink_info!(self.log, "shutting down");
        let links: Vec<u32> = self.links.keys().copied().collect();
        let now = Instant::now();
        for l in links {
            self.remove_link(l, now);
        }
        0
    }

    fn next_deadline(&self) -> Option<Instant> {
        let wifi = self.links.values().filter_map(Supplicant::next_deadline);
        let wfd = self
            .sessions
            .values()
            .filter_map(|h| h.session.next_deadline());
        wifi.chain(wfd).min()
    }

    fn dispatch(&mut self, ev: ManagerEvent) {
        let now = Instant::now();
        match ev {
            ManagerEvent::Wifi(ev) => {
                let link = match &ev {
                    WifiIoEvent::Wpas { link, .. } | WifiIoEvent::Dhcp { link, .. } => *link,
                };
                if let Some(s) = self.links.get_mut(&link) {
                    s.handle_io(ev, now);
                } else {
                    sink_debug!(self.log, "I/O for unmanaged link {}", link);
                }
            }
            ManagerEvent::Encoder { session, io } => {
                if let Some(h) = self.sessions.get_mut(&session) {
                    h.session.handle_encoder_io(io, now);
                    self.pump_session(session, now);
                }
            }
            ManagerEvent::SessionAccept { session, stream } => {
                self.on_session_accept(session, stream, now);
            }
            ManagerEvent::SessionConn { session, ev } => {
                if let Some(h) = self.sessions.get_mut(&session) {
                    match ev {
                        ConnEvent::Bytes(data) => h.session.feed_bytes(&data, now),
                        ConnEvent::Hup => h.session.transport_hup(now),
                    }
                    self.pump_session(session, now);
                }
            }
            ManagerEvent::Shutdown => SHUTDOWN.store(true, Ordering::Relaxed),
        }
    }

    fn on_session_accept(&mut self, id: u32, stream: TcpStream, now: Instant) {
        let Some(h) = self.sessions.get_mut(&id) else {
            return;
        };
        sink_info!(self.log, "session {:X}: RTSP connection established", id);

        let writer = spawn_connection_threads(stream, self.tx.clone(), move |ev| {
            ManagerEvent::SessionConn { session: id, ev }
        });
        match writer {
            Ok(writer) => {
                h.writer = Some(writer);
                h.session.attach_transport();
                if let Err(e) = h.session.start_caps_exchange(now) {
                    sink_error!(self.log, "session {:X}: cannot start: {}", id, e);
                    h.session.terminate(now);
                }
                self.pump_session(id, now);
            }
            Err(e) => {
                sink_error!(self.log, "session {:X}: connection setup failed: {}", id, e);
                h.session.terminate(now);
                self.pump_session(id, now);
            }
        }
    }

    /// Flush a session's wire output and facade events; destroy it once
    /// terminated.
    fn pump_session(&mut self, id: u32, now: Instant) {
        let mut terminated = false;
        let mut events = Vec::new();

        if let Some(h) = self.sessions.get_mut(&id) {
            for raw in h.session.take_wire() {
                if let Some(w) = &h.writer
                    && !w.send(raw)
                {
                    break;
                }
            }
            events = h.session.drain_events();
            terminated = h.session.state() == SessionState::Terminating;
        }

        for ev in &events {
            self.log_wfd_event(ev);
        }
        if terminated {
            self.destroy_session(id, now);
        }
    }

    fn tick(&mut self, now: Instant) {
        for s in self.links.values_mut() {
            s.on_tick(now);
        }
        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(h) = self.sessions.get_mut(&id) {
                h.session.on_tick(now);
            }
            self.pump_session(id, now);
        }
    }

    /// Facade events; the D-Bus surface is a named collaborator, so the
    /// daemon itself just records them.
    fn drain_facade(&mut self) {
        let mut wifi_events: Vec<(u32, WifiEvent)> = Vec::new();
        for (id, s) in &mut self.links {
            for ev in s.drain_events() {
                wifi_events.push((*id, ev));
            }
        }
        for (_, ev) in wifi_events {
            self.log_wifi_event(&ev);
        }
    }

    fn log_wifi_event(&self, ev: &WifiEvent) {
        match ev {
            WifiEvent::FormationFailure { mac, reason, .. } => {
                sink_warn!(self.log, "peer {}: formation failure: {}", mac, reason);
            }
            WifiEvent::ConnectedChanged { mac, connected, .. } => {
                sink_info!(self.log, "peer {}: connected={}", mac, connected);
            }
            other => sink_debug!(self.log, "wifi event: {:?}", other),
        }
    }

    fn log_wfd_event(&self, ev: &WfdEvent) {
        match ev {
            WfdEvent::StateChanged { session, state } => {
                sink_info!(self.log, "session {:X}: state {:?}", session, state);
            }
            WfdEvent::Ended { session } => {
                sink_info!(self.log, "session {:X}: ended", session);
            }
            WfdEvent::Error { session, reason } => {
                sink_error!(self.log, "session {:X}: {}", session, reason);
            }
        }
    }
}

/// Resolve an interface name to its kernel index via sysfs; the full
/// netlink enumeration lives outside this daemon.
#[must_use]
pub fn ifindex_of(ifname: &str) -> Option<u32> {
    std::fs::read_to_string(format!("/sys/class/net/{ifname}/ifindex"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
