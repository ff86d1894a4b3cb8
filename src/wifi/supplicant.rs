//! Supervision of one external P2P supplicant process per link.
//!
//! The supplicant runs as a child of ours; we write its config, open its
//! control sockets, feed its event stream into the link model and issue
//! commands. All socket traffic arrives through the owning loop as
//! [`WifiIoEvent`]s; handlers mutate the model and enqueue
//! [`WifiEvent`]s which the loop drains once the current event is fully
//! processed.
//!
//! Lifecycle: `Idle → Spawned → Open → Ready`, with rate-limited
//! restarts on failure. Two restarts are allowed within 10 s (grace
//! period 200 ms); beyond that the next attempt waits 30 s. Spawn
//! failures have their own budget of 3 per 10 s, then a 60 s cool-down.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use crate::log::{LogLevel, LogSink};
use crate::proc;
use crate::wifi::events::{Provision, WifiEvent};
use crate::wifi::group::{DhcpIo, DhcpLine, Group};
use crate::wifi::link::Link;
use crate::wifi::peer::normalize_mac;
use crate::wifi::ratelimit::RateLimit;
use crate::wifi::wifi_error::WifiError;
use crate::wifi::wpas::{WpasIo, WpasMessage, WpasSocket, request_line};
use crate::{sink_debug, sink_error, sink_info, sink_warn};

const STARTUP_DELAY: Duration = Duration::from_millis(200);
/// Budget for one control-socket request to be answered.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_GRACE: Duration = Duration::from_millis(200);
const RESTART_COOLDOWN: Duration = Duration::from_secs(30);
const EXEC_GRACE: Duration = Duration::from_secs(1);
const EXEC_COOLDOWN: Duration = Duration::from_secs(60);
const RATE_WINDOW: Duration = Duration::from_secs(10);
const RESTART_BURST: u32 = 2;
const EXEC_BURST: u32 = 3;

/// Which control socket a datagram came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpasSource {
    Global,
    Dev,
}

/// Raw I/O arriving at the owning loop, tagged with the link ifindex.
#[derive(Debug)]
pub enum WifiIoEvent {
    Wpas {
        link: u32,
        source: WpasSource,
        io: WpasIo,
    },
    Dhcp {
        link: u32,
        ifname: String,
        io: DhcpIo,
    },
}

#[derive(Debug, Clone)]
pub struct SupplicantConfig {
    /// Control-socket directory, `/run/miracle/wifi` in production.
    pub ctrl_dir: PathBuf,
    pub wpas_binary: String,
    pub dhcp_binary: String,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplicantState {
    Idle,
    /// Child running, control sockets not attached yet.
    Spawned,
    /// Attached; initial setup commands in flight.
    Open,
    /// Setup complete, link is usable.
    Ready,
    /// Failed; restart timer armed.
    Dead,
}

/// Reply routing for the strictly-ordered control interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallTag {
    Attach,
    DevAttach,
    Status,
    SetDeviceName,
    DisallowFreq,
    PeerEnum,
    SetWifiDisplay,
    SubelemSet,
    Find,
    StopFind,
    Connect,
    GroupRemove,
    PeerInfo,
}

struct Channel {
    sock: WpasSocket,
    /// Outstanding requests with their reply deadlines; the control
    /// interface answers strictly in order, so the front is the oldest.
    calls: VecDeque<(CallTag, Instant)>,
    stop: Arc<AtomicBool>,
}

impl Channel {
    fn request(&mut self, line: &str, tag: CallTag) -> Result<(), WifiError> {
        self.sock.send(line)?;
        self.calls.push_back((tag, Instant::now() + CALL_TIMEOUT));
        Ok(())
    }

    fn pop_call(&mut self) -> Option<CallTag> {
        self.calls.pop_front().map(|(tag, _)| tag)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.calls.front().map(|(_, deadline)| *deadline)
    }

    fn expired(&self, now: Instant) -> bool {
        self.calls.front().is_some_and(|(_, deadline)| *deadline <= now)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct Supplicant {
    link: Link,
    state: SupplicantState,
    cfg: SupplicantConfig,
    log: Arc<dyn LogSink>,
    tx: mpsc::Sender<WifiIoEvent>,

    child: Option<Child>,
    conf_path: PathBuf,
    global_ctrl: PathBuf,
    dev_ctrl: PathBuf,

    global: Option<Channel>,
    dev: Option<Channel>,
    /// Events are taken from the per-device socket; the global socket
    /// only contributes events that carry an interface tag.
    use_dev_events: bool,

    restart_rate: RateLimit,
    exec_rate: RateLimit,
    open_cnt: u64,
    timer: Option<Instant>,

    setup_cnt: usize,
    has_p2p: bool,
    has_wfd: bool,
    p2p_scanning: bool,
    p2p_mac: Option<String>,

    groups: Vec<Group>,
    /// At most one P2P_CONNECT outstanding (peer P2P address).
    pending: Option<String>,

    out: VecDeque<WifiEvent>,
}

impl Supplicant {
    #[must_use]
    pub fn new(
        link: Link,
        cfg: SupplicantConfig,
        log: Arc<dyn LogSink>,
        tx: mpsc::Sender<WifiIoEvent>,
    ) -> Self {
        let conf_path = cfg
            .ctrl_dir
            .join(format!("{}-{}.conf", link.ifname, link.ifindex));
        let global_ctrl = cfg
            .ctrl_dir
            .join(format!("{}-{}.global", link.ifname, link.ifindex));
        let dev_ctrl = cfg.ctrl_dir.join(format!("p2p-dev-{}", link.ifname));

        Self {
            link,
            state: SupplicantState::Idle,
            cfg,
            log,
            tx,
            child: None,
            conf_path,
            global_ctrl,
            dev_ctrl,
            global: None,
            dev: None,
            use_dev_events: false,
            restart_rate: RateLimit::new(RATE_WINDOW, RESTART_BURST),
            exec_rate: RateLimit::new(RATE_WINDOW, EXEC_BURST),
            open_cnt: 0,
            timer: None,
            setup_cnt: 0,
            has_p2p: false,
            has_wfd: false,
            p2p_scanning: false,
            p2p_mac: None,
            groups: Vec::new(),
            pending: None,
            out: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }

    #[must_use]
    pub fn state(&self) -> SupplicantState {
        self.state
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SupplicantState::Ready
    }

    #[must_use]
    pub fn p2p_scanning(&self) -> bool {
        self.is_ready() && self.has_p2p && self.p2p_scanning
    }

    #[must_use]
    pub fn local_p2p_mac(&self) -> Option<&str> {
        self.p2p_mac.as_deref()
    }

    #[must_use]
    pub fn group(&self, ifname: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.ifname == ifname)
    }

    /// Drain facade events produced by the last handled I/O event.
    pub fn drain_events(&mut self) -> Vec<WifiEvent> {
        self.out.drain(..).collect()
    }

    // ---- Lifecycle ---------------------------------------------------

    /// Spawn the supplicant child. The 200 ms startup timer delays the
    /// first connect attempt.
    ///
    /// # Errors
    /// Config write or spawn failures.
    pub fn start(&mut self, now: Instant) -> Result<(), WifiError> {
        if self.child.is_some() {
            return Ok(());
        }

        self.restart_rate.reset();
        self.exec_rate.reset();

        std::fs::create_dir_all(&self.cfg.ctrl_dir)?;
        self.write_config()?;
        self.spawn()?;
        self.timer = Some(now + STARTUP_DELAY);
        Ok(())
    }

    /// Deliberate stop: kill the child, close the sockets, flush the
    /// model. No restart timer is armed.
    pub fn stop(&mut self) {
        self.timer = None;
        if let Some(mut child) = self.child.take() {
            proc::terminate(&mut child);
        }
        self.close();
        self.stopped();
        self.state = SupplicantState::Idle;
    }

    fn write_config(&self) -> Result<(), WifiError> {
        let mut f = std::fs::File::create(&self.conf_path)?;
        write!(
            f,
            "# Written by rustycastd, regenerated on every start\n\
             device_name={}\n\
             device_type=1-0050F204-1\n\
             config_methods={}\n\
             driver_param=p2p_device=1\n\
             ap_scan=1\n",
            self.link.friendly_name.as_deref().unwrap_or("Miracle"),
            self.link.config_methods.as_deref().unwrap_or("pbc"),
        )?;
        Ok(())
    }

    fn spawn(&mut self) -> Result<(), WifiError> {
        let mut cmd = Command::new(&self.cfg.wpas_binary);
        if let Some(flag) = self.cfg.log_level.child_verbosity() {
            cmd.arg(flag);
        }
        cmd.arg("-c")
            .arg(&self.conf_path)
            .arg("-C")
            .arg(&self.cfg.ctrl_dir)
            .arg("-i")
            .arg(&self.link.ifname)
            .arg("-g")
            .arg(&self.global_ctrl)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(WifiError::Spawn)?;
        sink_info!(self.log, "supplicant for {} spawned as pid {}", self.link.ifname, child.id());
        self.child = Some(child);
        self.open_cnt = 0;
        self.state = SupplicantState::Spawned;
        Ok(())
    }

    fn open(&mut self) -> Result<(), WifiError> {
        sink_debug!(self.log, "open supplicant of {}", self.link.ifname);

        let sock = WpasSocket::open(&self.global_ctrl, &self.cfg.ctrl_dir)?;
        let stop = Arc::new(AtomicBool::new(false));
        let link = self.link.ifindex;
        sock.spawn_reader(stop.clone(), self.tx.clone(), move |io| {
            WifiIoEvent::Wpas {
                link,
                source: WpasSource::Global,
                io,
            }
        })?;

        let mut ch = Channel {
            sock,
            calls: VecDeque::new(),
            stop,
        };
        ch.request("ATTACH", CallTag::Attach)?;
        self.global = Some(ch);
        self.state = SupplicantState::Open;
        Ok(())
    }

    fn close(&mut self) {
        self.global = None;
        self.dev = None;
        self.use_dev_events = false;
    }

    /// Fatal failure: tear down, flush, schedule the restart.
    pub(crate) fn failed(&mut self, now: Instant) {
        let grace = if self.restart_rate.test(now) {
            sink_error!(
                self.log,
                "supplicant of {} failed unexpectedly, relaunching after short grace period",
                self.link.ifname
            );
            RESTART_GRACE
        } else {
            sink_error!(
                self.log,
                "supplicant of {} failed again, entering {}s cool-down before relaunching",
                self.link.ifname,
                RESTART_COOLDOWN.as_secs()
            );
            RESTART_COOLDOWN
        };

        if let Some(mut child) = self.child.take() {
            proc::terminate(&mut child);
        }
        self.close();
        self.stopped();
        self.state = SupplicantState::Dead;
        self.timer = Some(now + grace);
    }

    /// Flush the runtime model after the child went away.
    fn stopped(&mut self) {
        if let Some(mac) = self.pending.take() {
            self.out.push_back(WifiEvent::FormationFailure {
                link: self.link.ifindex,
                mac,
                reason: "lost",
            });
        }

        for g in &mut self.groups {
            g.stop_dhcp();
        }
        self.groups.clear();

        for mac in self.link.clear_peers() {
            self.out.push_back(WifiEvent::PeerLost {
                link: self.link.ifindex,
                mac,
            });
        }

        self.p2p_mac = None;
        self.p2p_scanning = false;
        self.has_p2p = false;
        self.has_wfd = false;
        self.setup_cnt = 0;

        if self.state == SupplicantState::Ready {
            self.out.push_back(WifiEvent::LinkStopped {
                link: self.link.ifindex,
            });
        }
    }

    /// Earliest internal deadline, for the owning loop's sleep.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.timer,
            self.global.as_ref().and_then(Channel::next_deadline),
            self.dev.as_ref().and_then(Channel::next_deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Advance due timers: spawn retry, connect retry, restart, and the
    /// per-request reply budget.
    pub fn on_tick(&mut self, now: Instant) {
        let stuck = self.global.as_ref().is_some_and(|c| c.expired(now))
            || self.dev.as_ref().is_some_and(|c| c.expired(now));
        if stuck {
            sink_error!(
                self.log,
                "supplicant of {} stopped answering commands",
                self.link.ifname
            );
            self.failed(now);
            return;
        }

        let Some(due) = self.timer else { return };
        if now < due {
            return;
        }
        self.timer = None;

        // A dead child that nobody reported yet shows up here.
        if let Some(child) = self.child.as_mut()
            && matches!(child.try_wait(), Ok(Some(_)))
        {
            self.child = None;
            self.failed(now);
            return;
        }

        if self.child.is_none() {
            match self.start_respawn(now) {
                Ok(()) => self.timer = Some(now + STARTUP_DELAY),
                Err(_) => {
                    let grace = if self.exec_rate.test(now) {
                        sink_error!(
                            self.log,
                            "cannot execute supplicant, retrying after short grace period"
                        );
                        EXEC_GRACE
                    } else {
                        sink_error!(
                            self.log,
                            "still cannot execute supplicant, waiting {}s before retrying",
                            EXEC_COOLDOWN.as_secs()
                        );
                        EXEC_COOLDOWN
                    };
                    self.timer = Some(now + grace);
                }
            }
        } else if !matches!(self.state, SupplicantState::Open | SupplicantState::Ready) {
            match self.open() {
                Ok(()) => {}
                Err(_) => {
                    // Cannot connect yet; linear backoff per attempt.
                    self.open_cnt = (self.open_cnt + 1).min(1000);
                    if self.open_cnt == 5 {
                        sink_warn!(
                            self.log,
                            "still cannot connect to supplicant of {} after 5 retries",
                            self.link.ifname
                        );
                    }
                    self.timer = Some(now + STARTUP_DELAY * self.open_cnt as u32);
                }
            }
        }
    }

    fn start_respawn(&mut self, _now: Instant) -> Result<(), WifiError> {
        self.write_config()?;
        self.spawn()
    }

    // ---- I/O dispatch ------------------------------------------------

    pub fn handle_io(&mut self, ev: WifiIoEvent, now: Instant) {
        match ev {
            WifiIoEvent::Wpas { source, io, .. } => match io {
                WpasIo::Datagram(text) => self.handle_datagram(source, &text, now),
                WpasIo::Hup => {
                    sink_error!(
                        self.log,
                        "HUP on supplicant socket of {}",
                        self.link.ifname
                    );
                    self.failed(now);
                }
            },
            WifiIoEvent::Dhcp { ifname, io, .. } => match io {
                DhcpIo::Line(line) => self.handle_dhcp_line(&ifname, &line),
                DhcpIo::Exited => {
                    sink_error!(
                        self.log,
                        "DHCP helper for {} died, stopping connection",
                        ifname
                    );
                    self.free_group(&ifname);
                }
            },
        }
    }

    fn handle_datagram(&mut self, source: WpasSource, text: &str, now: Instant) {
        crate::wire_log!(self.log, "{} <- {}", self.link.ifname, text.trim_end());
        let m = WpasMessage::parse(text);

        if m.is_event() {
            // With a working per-device socket, the global one repeats
            // events without proper routing; only tagged ones count.
            let take = match source {
                WpasSource::Dev => true,
                WpasSource::Global => !self.use_dev_events || m.ifname().is_some(),
            };
            if take {
                self.handle_event(&m);
            }
            return;
        }

        let tag = match source {
            WpasSource::Global => self.global.as_mut().and_then(Channel::pop_call),
            WpasSource::Dev => self.dev.as_mut().and_then(Channel::pop_call),
        };
        match tag {
            Some(tag) => self.handle_reply(tag, &m, now),
            None => sink_debug!(self.log, "stray supplicant reply: {}", m.raw()),
        }
    }

    // ---- Replies -----------------------------------------------------

    fn handle_reply(&mut self, tag: CallTag, m: &WpasMessage, now: Instant) {
        match tag {
            CallTag::Attach => self.reply_attach(m, now),
            CallTag::DevAttach => {
                if m.is_ok() {
                    self.started();
                } else {
                    sink_error!(
                        self.log,
                        "cannot attach to dev socket of {}",
                        self.link.ifname
                    );
                    self.failed(now);
                }
            }
            CallTag::Status => self.reply_status(m, now),
            CallTag::DisallowFreq => {
                self.setup_cnt = self.setup_cnt.saturating_sub(1);
                if !m.is_ok() {
                    sink_warn!(self.log, "cannot set p2p disallow_freq field");
                }
                self.try_ready();
            }
            CallTag::PeerEnum => self.reply_peer_enum(m),
            CallTag::SetWifiDisplay => self.reply_set_wifi_display(m),
            CallTag::PeerInfo => {
                if !m.is_fail() {
                    self.parse_peer(m);
                }
            }
            CallTag::Find => {
                // If already scanning, ignore any failures.
                if self.p2p_scanning {
                    return;
                }
                if !m.is_ok() {
                    sink_warn!(self.log, "P2P_FIND failed");
                    return;
                }
                sink_debug!(self.log, "p2p-scanning now active on {}", self.link.ifname);
                self.p2p_scanning = true;
                self.out.push_back(WifiEvent::ScanChanged {
                    link: self.link.ifindex,
                    scanning: true,
                });
            }
            // Fire-and-forget commands; failures only matter in the log.
            CallTag::SetDeviceName | CallTag::SubelemSet | CallTag::StopFind
            | CallTag::Connect | CallTag::GroupRemove => {
                if m.is_fail() {
                    sink_debug!(self.log, "supplicant rejected command: {}", m.raw());
                }
            }
        }
    }

    fn reply_attach(&mut self, m: &WpasMessage, now: Instant) {
        if !m.is_ok() {
            sink_error!(
                self.log,
                "cannot attach to global supplicant socket of {}",
                self.link.ifname
            );
            self.failed(now);
            return;
        }

        // Legacy drivers expose a separate p2p-dev-<iface> socket with
        // working event forwarding; prefer it when it opens.
        match WpasSocket::open(&self.dev_ctrl, &self.cfg.ctrl_dir) {
            Ok(sock) => {
                let stop = Arc::new(AtomicBool::new(false));
                let link = self.link.ifindex;
                let spawned = sock.spawn_reader(stop.clone(), self.tx.clone(), move |io| {
                    WifiIoEvent::Wpas {
                        link,
                        source: WpasSource::Dev,
                        io,
                    }
                });
                if spawned.is_err() {
                    self.failed(now);
                    return;
                }

                let mut ch = Channel {
                    sock,
                    calls: VecDeque::new(),
                    stop,
                };
                if ch.request("ATTACH", CallTag::DevAttach).is_err() {
                    self.failed(now);
                    return;
                }
                self.dev = Some(ch);
                self.use_dev_events = true;
            }
            Err(_) => {
                self.use_dev_events = false;
                self.started();
            }
        }
    }

    /// Attached; run the initial STATUS + setup sequence.
    fn started(&mut self) {
        self.p2p_scanning = false;
        self.setup_cnt = 1;
        if self.global_request("STATUS", CallTag::Status).is_err() {
            return;
        }
        self.try_ready();
    }

    fn reply_status(&mut self, m: &WpasMessage, _now: Instant) {
        self.setup_cnt = self.setup_cnt.saturating_sub(1);

        let p2p_state = m.dict("p2p_state");
        let wifi_display = m.dict("wifi_display");
        let p2p_mac = m.dict("p2p_device_address").map(normalize_mac);

        match p2p_state {
            None => sink_warn!(self.log, "supplicant or driver does not support P2P"),
            Some("DISABLED") => {
                sink_warn!(self.log, "P2P support disabled on {}", self.link.ifname);
            }
            Some(_) => {
                self.has_p2p = true;

                let name = self
                    .link
                    .friendly_name
                    .clone()
                    .unwrap_or_else(|| "Miracle".to_string());
                let _ = self.global_request(
                    &request_line("SET", &["device_name", &name]),
                    CallTag::SetDeviceName,
                );

                self.setup_cnt += 1;
                let _ = self.global_request(
                    &request_line("P2P_SET", &["disallow_freq", "5180-5900"]),
                    CallTag::DisallowFreq,
                );

                self.setup_cnt += 1;
                let _ = self.global_request(
                    &request_line("P2P_PEER", &["FIRST"]),
                    CallTag::PeerEnum,
                );
            }
        }

        if wifi_display.is_none() {
            sink_warn!(self.log, "supplicant does not support wifi-display");
        } else if self.has_p2p {
            self.has_wfd = true;
            self.setup_cnt += 1;
            let _ = self.global_request(
                &request_line("SET", &["wifi_display", "1"]),
                CallTag::SetWifiDisplay,
            );
        }

        if let Some(mac) = p2p_mac {
            sink_debug!(self.log, "local p2p-address is {}", mac);
            self.p2p_mac = Some(mac);
        }

        self.try_ready();
    }

    fn reply_peer_enum(&mut self, m: &WpasMessage) {
        self.setup_cnt = self.setup_cnt.saturating_sub(1);

        // FAIL means end-of-list. Enumerating is racy against peers
        // leaving; failures here are not fatal.
        if !m.is_fail() {
            match m.arg(0).map(str::to_string) {
                Some(mac) => {
                    self.parse_peer(m);
                    self.setup_cnt += 1;
                    let next = format!("NEXT-{mac}");
                    if self
                        .global_request(&request_line("P2P_PEER", &[&next]), CallTag::PeerEnum)
                        .is_err()
                    {
                        self.setup_cnt = self.setup_cnt.saturating_sub(1);
                    }
                }
                None => sink_warn!(self.log, "cannot read some initial P2P peers, ignoring"),
            }
        }

        self.try_ready();
    }

    fn reply_set_wifi_display(&mut self, m: &WpasMessage) {
        self.setup_cnt = self.setup_cnt.saturating_sub(1);

        if !m.is_ok() {
            sink_warn!(self.log, "cannot enable supplicant wifi-display support");
            self.has_wfd = false;
        }

        if self.has_wfd
            && let Some(sube) = self.link.wfd_subelements.clone()
            && !sube.is_empty()
        {
            let _ = self.global_request(
                &request_line("WFD_SUBELEM_SET", &["0", &sube]),
                CallTag::SubelemSet,
            );
        }

        self.try_ready();
    }

    fn try_ready(&mut self) {
        if self.state == SupplicantState::Ready || self.setup_cnt > 0 {
            return;
        }
        if !self.has_p2p {
            self.has_wfd = false;
        }
        self.state = SupplicantState::Ready;
        self.out.push_back(WifiEvent::LinkStarted {
            link: self.link.ifindex,
        });
    }

    fn global_request(&mut self, line: &str, tag: CallTag) -> Result<(), WifiError> {
        match self.global.as_mut() {
            Some(ch) => ch.request(line, tag),
            None => Err(WifiError::NotReady),
        }
    }

    // ---- Events ------------------------------------------------------

    fn handle_event(&mut self, m: &WpasMessage) {
        let name = m.name();
        if name.is_empty() {
            sink_debug!(self.log, "unnamed supplicant event: {}", m.raw());
            return;
        }

        if EVENT_IGNORE.contains(&name) {
            return;
        }

        match name {
            "P2P-FIND-STOPPED" => self.event_find_stopped(),
            "P2P-DEVICE-FOUND" => self.event_device_found(m),
            "P2P-DEVICE-LOST" => self.event_device_lost(m),
            "P2P-PROV-DISC-PBC-REQ" => self.event_prov_disc(m, Provision::Pbc, false),
            "P2P-PROV-DISC-SHOW-PIN" => self.event_prov_disc(m, Provision::Display, true),
            "P2P-PROV-DISC-ENTER-PIN" => self.event_prov_disc(m, Provision::Pin, false),
            "P2P-GO-NEG-REQUEST" => self.event_go_neg_request(m),
            "P2P-GO-NEG-SUCCESS" => self.event_go_neg_success(m),
            "P2P-GO-NEG-FAILURE" => self.fail_pending("group owner negotiation failed"),
            "P2P-GROUP-FORMATION-FAILURE" => self.fail_pending("unknown"),
            "P2P-GROUP-STARTED" => self.event_group_started(m),
            "P2P-GROUP-REMOVED" => self.event_group_removed(m),
            "AP-STA-CONNECTED" => self.event_ap_sta_connected(m),
            "AP-STA-DISCONNECTED" => self.event_ap_sta_disconnected(m),
            _ => sink_debug!(self.log, "unhandled supplicant event: {}", m.raw()),
        }
    }

    fn event_find_stopped(&mut self) {
        if !self.p2p_scanning {
            return;
        }
        sink_debug!(self.log, "p2p-scanning stopped on {}", self.link.ifname);
        self.p2p_scanning = false;
        self.out.push_back(WifiEvent::ScanChanged {
            link: self.link.ifindex,
            scanning: false,
        });
    }

    /// Upsert a peer from a P2P-DEVICE-FOUND event or a P2P_PEER report.
    fn parse_peer(&mut self, m: &WpasMessage) {
        let Some(mac) = m.arg(0) else {
            sink_debug!(self.log, "no p2p-mac in peer information: {}", m.raw());
            return;
        };
        let link = self.link.ifindex;

        let (peer, fresh) = self.link.upsert_peer(mac);
        let mac = peer.p2p_mac.clone();
        if fresh {
            self.out.push_back(WifiEvent::PeerFound {
                link,
                mac: mac.clone(),
            });
        }

        // The P2P_PEER report calls it 'device_name', the discovery
        // event 'name'. Allow either.
        let name = m.dict("device_name").or_else(|| m.dict("name"));
        if let Some(name) = name {
            let peer = self.link.peer_mut(&mac);
            if let Some(p) = peer
                && p.friendly_name.as_deref() != Some(name)
            {
                p.friendly_name = Some(name.to_string());
                self.out.push_back(WifiEvent::PeerFriendlyNameChanged {
                    link,
                    mac: mac.clone(),
                });
            }
        } else {
            sink_debug!(self.log, "no device-name in peer information: {}", m.raw());
        }

        // wfd_subelems carries all sub-elements, wfd_dev_info only the
        // device-info one; take what we can get.
        let sube = m.dict("wfd_subelems").or_else(|| m.dict("wfd_dev_info"));
        if let Some(sube) = sube {
            let sube = sube.strip_prefix("0x").unwrap_or(sube);
            if let Some(p) = self.link.peer_mut(&mac)
                && p.wfd_subelements.as_deref() != Some(sube)
            {
                p.wfd_subelements = Some(sube.to_string());
                self.out.push_back(WifiEvent::PeerSubelementsChanged { link, mac });
            }
        }
    }

    fn event_device_found(&mut self, m: &WpasMessage) {
        let Some(mac) = m.dict("p2p_dev_addr").map(normalize_mac) else {
            sink_debug!(self.log, "no p2p_dev_addr in P2P-DEVICE-FOUND: {}", m.raw());
            return;
        };

        self.parse_peer(m);

        // The discovery event is small; ask for the full report.
        sink_debug!(self.log, "requesting data for new peer {}", mac);
        if self
            .global_request(&request_line("P2P_PEER", &[&mac]), CallTag::PeerInfo)
            .is_err()
        {
            sink_warn!(self.log, "cannot retrieve peer information for {}", mac);
        }
    }

    fn event_device_lost(&mut self, m: &WpasMessage) {
        let Some(mac) = m.dict("p2p_dev_addr").map(normalize_mac) else {
            sink_debug!(self.log, "no p2p_dev_addr in P2P-DEVICE-LOST: {}", m.raw());
            return;
        };
        if self.link.peer(&mac).is_none() {
            sink_debug!(self.log, "stale P2P-DEVICE-LOST: {}", m.raw());
            return;
        }
        sink_debug!(self.log, "lost peer {}", mac);
        self.free_peer(&mac);
    }

    fn free_peer(&mut self, mac: &str) {
        if self.pending.as_deref() == Some(mac) {
            self.pending = None;
            self.out.push_back(WifiEvent::FormationFailure {
                link: self.link.ifindex,
                mac: mac.to_string(),
                reason: "lost",
            });
        }
        self.peer_drop_group(mac);
        if self.link.remove_peer(mac).is_some() {
            self.out.push_back(WifiEvent::PeerLost {
                link: self.link.ifindex,
                mac: mac.to_string(),
            });
        }
    }

    fn event_prov_disc(&mut self, m: &WpasMessage, prov: Provision, with_pin: bool) {
        let Some(mac) = m.dict("p2p_dev_addr").map(normalize_mac) else {
            sink_debug!(self.log, "no p2p_dev_addr in provision event: {}", m.raw());
            return;
        };
        let pin = if with_pin {
            match m.arg(1) {
                Some(pin) => Some(pin.to_string()),
                None => {
                    sink_debug!(self.log, "no pin given in provision event: {}", m.raw());
                    return;
                }
            }
        } else {
            None
        };

        let Some(peer) = self.link.peer_mut(&mac) else {
            sink_debug!(self.log, "stale provision event: {}", m.raw());
            return;
        };
        peer.prov = Some(prov);
        peer.pin = pin.clone();

        self.out.push_back(WifiEvent::ProvisionDiscovery {
            link: self.link.ifindex,
            mac,
            prov,
            pin,
        });
    }

    fn event_go_neg_request(&mut self, m: &WpasMessage) {
        let Some(mac) = m.arg(0).map(normalize_mac) else {
            sink_debug!(self.log, "no p2p-mac in P2P-GO-NEG-REQUEST: {}", m.raw());
            return;
        };
        let Some(peer) = self.link.peer_mut(&mac) else {
            sink_debug!(self.log, "stale P2P-GO-NEG-REQUEST: {}", m.raw());
            return;
        };

        // Provisioning should have been negotiated by a preceding
        // PROV-DISC event; fall back to pbc.
        if peer.prov.is_none() {
            peer.prov = Some(Provision::Pbc);
            peer.pin = None;
        }

        if peer.group.is_some() {
            sink_debug!(
                self.log,
                "GO negotiation request from already connected peer {}",
                mac
            );
            return;
        }

        let prov = peer.prov.unwrap_or(Provision::Pbc);
        let pin = peer.pin.clone();
        sink_debug!(self.log, "GO negotiation request from {}", mac);
        self.out.push_back(WifiEvent::GoNegRequest {
            link: self.link.ifindex,
            mac,
            prov,
            pin,
        });
    }

    fn event_go_neg_success(&mut self, m: &WpasMessage) {
        let Some(mac) = m.dict("peer_dev").map(normalize_mac) else {
            sink_debug!(self.log, "no peer_dev in P2P-GO-NEG-SUCCESS: {}", m.raw());
            return;
        };
        let Some(sta) = m.dict("peer_iface").map(normalize_mac) else {
            sink_debug!(self.log, "no peer_iface in P2P-GO-NEG-SUCCESS: {}", m.raw());
            return;
        };

        let log = self.log.clone();
        match self.link.peer_mut(&mac) {
            Some(peer) if peer.group.is_none() => {
                if peer.sta_mac.as_deref() != Some(sta.as_str()) {
                    sink_debug!(
                        log,
                        "set station MAC for {} to {} (via GO-NEG-SUCCESS)",
                        mac,
                        sta
                    );
                    peer.sta_mac = Some(sta);
                }
            }
            Some(_) => {
                sink_debug!(log, "P2P-GO-NEG-SUCCESS on already connected peer: {}", mac);
            }
            None => sink_debug!(log, "stale P2P-GO-NEG-SUCCESS: {}", m.raw()),
        }
    }

    fn fail_pending(&mut self, reason: &'static str) {
        if let Some(mac) = self.pending.take() {
            let name = self
                .link
                .peer(&mac)
                .map_or_else(|| mac.clone(), |p| p.name().to_string());
            sink_debug!(self.log, "peer {} connect failed: {}", name, reason);
            self.out.push_back(WifiEvent::FormationFailure {
                link: self.link.ifindex,
                mac,
                reason,
            });
        }
    }

    fn event_group_started(&mut self, m: &WpasMessage) {
        let Some(mac) = m.dict("go_dev_addr").map(normalize_mac) else {
            sink_debug!(self.log, "no go_dev_addr in P2P-GROUP-STARTED: {}", m.raw());
            return;
        };
        let Some(ifname) = m.arg(0).map(str::to_string) else {
            sink_debug!(self.log, "no ifname in P2P-GROUP-STARTED: {}", m.raw());
            return;
        };
        let Some(role) = m.arg(1) else {
            sink_debug!(self.log, "no GO/client type in P2P-GROUP-STARTED: {}", m.raw());
            return;
        };
        let is_go = role == "GO";

        let peer_known = self.link.peer(&mac).is_some();
        if !peer_known && self.p2p_mac.as_deref() != Some(mac.as_str()) {
            sink_debug!(self.log, "stray P2P-GROUP-STARTED: {}", m.raw());
            return;
        }

        if self.group(&ifname).is_none() && !self.create_group(&ifname, is_go) {
            return;
        }
        sink_debug!(
            self.log,
            "start {} group on {} as {}",
            if peer_known { "remote" } else { "local" },
            ifname,
            role
        );

        if peer_known {
            self.peer_set_group(&mac, &ifname);
            if let Some(g) = self.groups.iter_mut().find(|g| g.ifname == ifname) {
                g.peer = Some(mac);
            }
        }
    }

    fn create_group(&mut self, ifname: &str, go: bool) -> bool {
        sink_debug!(self.log, "new group: {}", ifname);
        let mut g = Group::new(ifname, go);

        if go {
            let used: Vec<u8> = self.groups.iter().filter_map(|g| g.subnet).collect();
            match Group::allocate_subnet(&used) {
                Some(n) => g.subnet = Some(n),
                None => {
                    sink_warn!(self.log, "out of free subnets for local groups");
                    return false;
                }
            }
        }

        let link = self.link.ifindex;
        let ifname_owned = ifname.to_string();
        let spawned = g.spawn_dhcp(
            &self.cfg.dhcp_binary,
            self.cfg.log_level,
            self.tx.clone(),
            move |io| WifiIoEvent::Dhcp {
                link,
                ifname: ifname_owned.clone(),
                io,
            },
        );
        if let Err(e) = spawned {
            sink_error!(self.log, "cannot spawn DHCP helper for {}: {}", ifname, e);
            return false;
        }

        self.groups.push(g);
        true
    }

    fn event_group_removed(&mut self, m: &WpasMessage) {
        let Some(ifname) = m.arg(0) else {
            sink_debug!(self.log, "no ifname in P2P-GROUP-REMOVED: {}", m.raw());
            return;
        };
        if self.group(ifname).is_none() {
            sink_debug!(self.log, "stray P2P-GROUP-REMOVED: {}", m.raw());
            return;
        }
        sink_debug!(self.log, "remove group {}", ifname);
        self.free_group(&ifname.to_string());
    }

    fn event_ap_sta_connected(&mut self, m: &WpasMessage) {
        let Some(mac) = m.dict("p2p_dev_addr").map(normalize_mac) else {
            sink_debug!(self.log, "no p2p_dev_addr in AP-STA-CONNECTED: {}", m.raw());
            return;
        };
        let Some(sta) = m.arg(0).map(normalize_mac) else {
            sink_debug!(self.log, "no station-mac in AP-STA-CONNECTED: {}", m.raw());
            return;
        };

        {
            let Some(peer) = self.link.peer_mut(&mac) else {
                sink_debug!(self.log, "stray AP-STA-CONNECTED: {}", m.raw());
                return;
            };
            if peer.group.is_some() {
                sink_debug!(
                    self.log,
                    "AP-STA-CONNECTED for already connected peer: {}",
                    m.raw()
                );
                return;
            }
            if peer.sta_mac.as_deref() != Some(sta.as_str()) {
                peer.sta_mac = Some(sta);
            }
        }

        let Some(ifname) = m.ifname().map(str::to_string) else {
            sink_debug!(self.log, "no ifname in AP-STA-CONNECTED: {}", m.raw());
            return;
        };
        if self.group(&ifname).is_none() {
            sink_debug!(self.log, "unknown ifname in AP-STA-CONNECTED: {}", m.raw());
            return;
        }

        sink_debug!(self.log, "bind peer {} to local group {}", mac, ifname);
        self.peer_set_group(&mac, &ifname);
        self.update_connected(&ifname);
    }

    fn event_ap_sta_disconnected(&mut self, m: &WpasMessage) {
        let Some(mac) = m.dict("p2p_dev_addr").map(normalize_mac) else {
            sink_debug!(self.log, "no p2p_dev_addr in AP-STA-DISCONNECTED: {}", m.raw());
            return;
        };
        if self.link.peer(&mac).is_none() {
            sink_debug!(self.log, "stray AP-STA-DISCONNECTED: {}", m.raw());
            return;
        }

        if self.pending.as_deref() == Some(mac.as_str()) {
            self.pending = None;
            let connected = self.link.peer(&mac).is_some_and(|p| p.connected);
            if !connected {
                self.out.push_back(WifiEvent::FormationFailure {
                    link: self.link.ifindex,
                    mac: mac.clone(),
                    reason: "disconnected",
                });
            }
        }

        sink_debug!(self.log, "unbind peer {} from its group", mac);
        self.peer_drop_group(&mac);
    }

    // ---- Groups ------------------------------------------------------

    fn peer_set_group(&mut self, mac: &str, ifname: &str) {
        let old = self.link.peer(mac).and_then(|p| p.group.clone());
        if old.as_deref() == Some(ifname) {
            return;
        }
        if old.is_some() {
            self.peer_drop_group(mac);
        }

        if let Some(p) = self.link.peer_mut(mac) {
            p.group = Some(ifname.to_string());
        }
        if let Some(g) = self.groups.iter_mut().find(|g| g.ifname == ifname) {
            g.users += 1;
        }
    }

    fn peer_drop_group(&mut self, mac: &str) {
        let Some(ifname) = self.link.peer_mut(mac).and_then(|p| p.group.take()) else {
            return;
        };

        let was_connected = {
            let Some(p) = self.link.peer_mut(mac) else { return };
            let was = p.connected;
            p.connected = false;
            p.remote_addr = None;
            p.sta_mac = None;
            was
        };
        if was_connected {
            self.out.push_back(WifiEvent::ConnectedChanged {
                link: self.link.ifindex,
                mac: mac.to_string(),
                connected: false,
            });
        }

        let mut now_unused = false;
        if let Some(g) = self.groups.iter_mut().find(|g| g.ifname == ifname) {
            if g.peer.as_deref() == Some(mac) {
                g.peer = None;
            }
            g.users = g.users.saturating_sub(1);
            now_unused = g.users == 0;
        }
        if now_unused {
            self.free_group(&ifname);
        }
    }

    /// Tear a group down: tell the supplicant, stop the helper, unbind
    /// every peer still pointing at it.
    fn free_group(&mut self, ifname: &str) {
        let Some(pos) = self.groups.iter().position(|g| g.ifname == ifname) else {
            return;
        };
        let mut g = self.groups.remove(pos);

        let _ = self.global_request(
            &request_line("P2P_GROUP_REMOVE", &[ifname]),
            CallTag::GroupRemove,
        );
        g.stop_dhcp();

        let bound: Vec<String> = self
            .link
            .peers()
            .filter(|p| p.group.as_deref() == Some(ifname))
            .map(|p| p.p2p_mac.clone())
            .collect();
        for mac in bound {
            if self.pending.as_deref() == Some(mac.as_str()) {
                self.pending = None;
            }
            let was_connected = {
                let Some(p) = self.link.peer_mut(&mac) else {
                    continue;
                };
                let was = p.connected;
                p.group = None;
                p.connected = false;
                p.remote_addr = None;
                p.sta_mac = None;
                was
            };
            if was_connected {
                self.out.push_back(WifiEvent::ConnectedChanged {
                    link: self.link.ifindex,
                    mac,
                    connected: false,
                });
            }
        }
    }

    fn handle_dhcp_line(&mut self, ifname: &str, line: &str) {
        sink_debug!(self.log, "dhcp-{}: {}", ifname, line);

        let parsed = match DhcpLine::parse(line) {
            Ok(p) => p,
            Err(_) => {
                sink_warn!(self.log, "invalid dhcp line on {}: {}", ifname, line);
                return;
            }
        };

        let Some(pos) = self.groups.iter().position(|g| g.ifname == ifname) else {
            sink_debug!(self.log, "dhcp line for unknown group {}", ifname);
            return;
        };

        match parsed {
            DhcpLine::Local(addr) => {
                self.groups[pos].local_addr = Some(addr.to_string());
            }
            DhcpLine::Gateway(addr) => {
                if let Some(mac) = self.groups[pos].peer.clone()
                    && let Some(p) = self.link.peer_mut(&mac)
                {
                    p.remote_addr = Some(addr.to_string());
                }
            }
            DhcpLine::Lease { mac, addr } => match self.link.peer_by_any_mac_mut(mac) {
                Some(p) => p.remote_addr = Some(addr.to_string()),
                None => sink_debug!(self.log, "ignore lease line for unknown mac {}", mac),
            },
        }

        self.update_connected(ifname);
    }

    /// A peer is connected exactly when its group knows the local
    /// address and the peer its remote one.
    fn update_connected(&mut self, ifname: &str) {
        let local_known = self
            .group(ifname)
            .is_some_and(|g| g.local_addr.is_some());
        if !local_known {
            return;
        }

        let link = self.link.ifindex;
        let newly: Vec<String> = self
            .link
            .peers_mut()
            .filter(|p| {
                p.group.as_deref() == Some(ifname) && p.remote_addr.is_some() && !p.connected
            })
            .map(|p| {
                p.connected = true;
                p.p2p_mac.clone()
            })
            .collect();

        for mac in newly {
            if self.pending.as_deref() == Some(mac.as_str()) {
                self.pending = None;
            }
            self.out.push_back(WifiEvent::ConnectedChanged {
                link,
                mac,
                connected: true,
            });
        }
    }

    // ---- Commands ----------------------------------------------------

    /// (Re-)issue a P2P scan. The supplicant's scan tracking is
    /// unreliable, so every request sends P2P_FIND again and the
    /// `p2p_scanning` flag follows the replies and events.
    ///
    /// # Errors
    /// `NotReady` before the setup sequence completed.
    pub fn start_scan(&mut self) -> Result<(), WifiError> {
        if !self.is_ready() || !self.has_p2p {
            return Err(WifiError::NotReady);
        }
        self.pending = None;
        self.global_request("P2P_FIND", CallTag::Find)?;
        sink_debug!(self.log, "sent P2P_FIND on {}", self.link.ifname);
        Ok(())
    }

    /// Always sent, even when we believe no scan is running; an async
    /// P2P_FIND might still be pending on the supplicant side.
    ///
    /// # Errors
    /// `NotReady` before the setup sequence completed.
    pub fn stop_scan(&mut self) -> Result<(), WifiError> {
        if !self.is_ready() || !self.has_p2p {
            return Err(WifiError::NotReady);
        }
        self.global_request("P2P_STOP_FIND", CallTag::StopFind)?;
        sink_debug!(self.log, "sent P2P_STOP_FIND on {}", self.link.ifname);
        Ok(())
    }

    /// Initiate a connection to `mac`. At most one connect is pending
    /// per supplicant.
    ///
    /// # Errors
    /// `Already` when a different connect is pending, `NotReady` before
    /// setup, `InvalidArgument` for unknown peers or missing PINs.
    pub fn connect(
        &mut self,
        mac: &str,
        prov: Option<Provision>,
        pin: Option<&str>,
    ) -> Result<(), WifiError> {
        if !self.is_ready() {
            return Err(WifiError::NotReady);
        }
        let mac = normalize_mac(mac);
        let Some(peer) = self.link.peer(&mac) else {
            return Err(WifiError::InvalidArgument("unknown peer"));
        };
        if peer.group.is_some() {
            return Ok(());
        }
        if let Some(pending) = &self.pending
            && pending != &mac
        {
            return Err(WifiError::Already);
        }

        let prov = prov.or(peer.prov).unwrap_or(Provision::Pbc);
        let pin = pin
            .map(str::to_string)
            .or_else(|| peer.pin.clone())
            .unwrap_or_default();

        sink_debug!(self.log, "connect to {} via {}/{}", mac, prov, pin);

        let line = match prov {
            Provision::Pbc => request_line("P2P_CONNECT", &[&mac, "pbc"]),
            Provision::Display | Provision::Pin | Provision::Keypad => {
                if pin.is_empty() {
                    return Err(WifiError::InvalidArgument("provision requires a pin"));
                }
                let kw = prov.to_string();
                request_line("P2P_CONNECT", &[&mac, &pin, &kw])
            }
        };
        self.global_request(&line, CallTag::Connect)?;
        self.pending = Some(mac);
        Ok(())
    }

    /// Drop the connection and the cached provisioning state; also used
    /// as a plain reset for unconnected peers.
    pub fn disconnect(&mut self, mac: &str) {
        let mac = normalize_mac(mac);
        sink_debug!(self.log, "disconnect from {}", mac);
        if let Some(p) = self.link.peer_mut(&mac) {
            p.pin = None;
            p.prov = None;
        }
        if self.pending.as_deref() == Some(mac.as_str()) {
            self.pending = None;
        }
        self.peer_drop_group(&mac);
    }

    /// # Errors
    /// `NotReady` before setup, `InvalidArgument` for an empty name.
    pub fn set_friendly_name(&mut self, name: &str) -> Result<(), WifiError> {
        if !self.is_ready() {
            return Err(WifiError::NotReady);
        }
        if name.is_empty() {
            return Err(WifiError::InvalidArgument("empty friendly name"));
        }
        self.global_request(
            &request_line("SET", &["device_name", name]),
            CallTag::SetDeviceName,
        )?;
        self.link.friendly_name = Some(name.to_string());
        Ok(())
    }

    /// # Errors
    /// `NotReady` before setup.
    pub fn set_wfd_subelements(&mut self, val: &str) -> Result<(), WifiError> {
        if !self.is_ready() {
            return Err(WifiError::NotReady);
        }
        self.global_request(
            &request_line("WFD_SUBELEM_SET", &["0", val]),
            CallTag::SubelemSet,
        )?;
        self.link.wfd_subelements = Some(val.to_string());
        Ok(())
    }
}

impl Drop for Supplicant {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            proc::terminate(&mut child);
        }
    }
}

/// Noisy supplicant events with no effect on the model.
const EVENT_IGNORE: &[&str] = &[
    "CTRL-EVENT-SCAN-STARTED",
    "CTRL-EVENT-SCAN-RESULTS",
    "CTRL-EVENT-EAP-STARTED",
    "CTRL-EVENT-EAP-PROPOSED-METHOD",
    "CTRL-EVENT-EAP-FAILURE",
    "CTRL-EVENT-EAP-STATUS",
    "CTRL-EVENT-EAP-METHOD",
    "CTRL-EVENT-BSS-REMOVED",
    "CTRL-EVENT-BSS-ADDED",
    "CTRL-EVENT-CONNECTED",
    "CTRL-EVENT-DISCONNECTED",
    "WPS-PBC-ACTIVE",
    "WPS-PBC-DISABLE",
    "WPS-AP-AVAILABLE-PBC",
    "WPS-AP-AVAILABLE-AUTH",
    "WPS-AP-AVAILABLE-PIN",
    "WPS-AP-AVAILABLE",
    "WPS-CRED-RECEIVED",
    "WPS-REG-SUCCESS",
    "WPS-SUCCESS",
    "WPS-ENROLLEE-SEEN",
    "P2P-GROUP-FORMATION-SUCCESS",
    "AP-ENABLED",
];

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use crate::log::NoopLogSink;
    use std::sync::mpsc::channel;

    fn test_supplicant() -> (Supplicant, mpsc::Receiver<WifiIoEvent>) {
        let (tx, rx) = channel();
        let mut link = Link::new(3, "wlan0");
        link.friendly_name = Some("TestCast".into());
        let cfg = SupplicantConfig {
            ctrl_dir: std::env::temp_dir().join("rustycast-test-ctrl"),
            wpas_binary: "wpa_supplicant".into(),
            dhcp_binary: "true".into(),
            log_level: LogLevel::Info,
        };
        (Supplicant::new(link, cfg, Arc::new(NoopLogSink), tx), rx)
    }

    fn ev(text: &str) -> WpasMessage {
        WpasMessage::parse(text)
    }

    #[test]
    fn device_found_and_lost_update_model() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();

        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee \
                 name='Some Sink' wfd_dev_info=0x00061c440032"));

        assert_eq!(s.link().peer_count(), 1);
        let peer = s.link().peer("02:aa:bb:cc:dd:ee").expect("peer");
        assert_eq!(peer.friendly_name.as_deref(), Some("Some Sink"));
        assert_eq!(peer.wfd_subelements.as_deref(), Some("00061c440032"));

        let events = s.drain_events();
        assert!(events.contains(&WifiEvent::PeerFound {
            link: 3,
            mac: "02:aa:bb:cc:dd:ee".into()
        }));

        s.handle_event(
            &ev("<3>P2P-DEVICE-LOST p2p_dev_addr=02:aa:bb:cc:dd:ee"));
        assert_eq!(s.link().peer_count(), 0);
        assert!(s.drain_events().contains(&WifiEvent::PeerLost {
            link: 3,
            mac: "02:aa:bb:cc:dd:ee".into()
        }));
    }

    #[test]
    fn provision_discovery_caches_pin() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();

        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee"));
        s.handle_event(
            &ev("<3>P2P-PROV-DISC-SHOW-PIN 02:aa:bb:cc:dd:ee 12345670 \
                 p2p_dev_addr=02:aa:bb:cc:dd:ee"));

        let peer = s.link().peer("02:aa:bb:cc:dd:ee").expect("peer");
        assert_eq!(peer.prov, Some(Provision::Display));
        assert_eq!(peer.pin.as_deref(), Some("12345670"));

        let evs = s.drain_events();
        assert!(evs.iter().any(|e| matches!(
            e,
            WifiEvent::ProvisionDiscovery { prov: Provision::Display, .. }
        )));
    }

    #[test]
    fn group_started_binds_peer_and_dhcp_lines_connect_it() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();

        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee"));
        s.handle_event(
            &ev("<3>P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-xy\" \
                 go_dev_addr=02:aa:bb:cc:dd:ee"));

        let g = s.group("p2p-wlan0-0").expect("group");
        assert!(g.go);
        assert_eq!(g.subnet, Some(50));
        assert_eq!(g.users, 1);
        assert_eq!(
            s.link().peer("02:aa:bb:cc:dd:ee").expect("peer").group.as_deref(),
            Some("p2p-wlan0-0")
        );
        s.drain_events();

        s.handle_dhcp_line("p2p-wlan0-0", "L:192.168.50.1");
        s.handle_dhcp_line("p2p-wlan0-0", "R:02:aa:bb:cc:dd:ee 192.168.50.77");

        let peer = s.link().peer("02:aa:bb:cc:dd:ee").expect("peer");
        assert!(peer.connected);
        assert_eq!(peer.remote_addr.as_deref(), Some("192.168.50.77"));
        assert!(s.drain_events().contains(&WifiEvent::ConnectedChanged {
            link: 3,
            mac: "02:aa:bb:cc:dd:ee".into(),
            connected: true
        }));
    }

    #[test]
    fn group_removed_disconnects_peers() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();

        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee"));
        s.handle_event(
            &ev("<3>P2P-GROUP-STARTED p2p-wlan0-0 client go_dev_addr=02:aa:bb:cc:dd:ee"));
        s.handle_dhcp_line("p2p-wlan0-0", "L:192.168.77.10");
        s.handle_dhcp_line("p2p-wlan0-0", "G:192.168.77.1");
        assert!(s.link().peer("02:aa:bb:cc:dd:ee").expect("peer").connected);
        s.drain_events();

        s.handle_event(&ev("<3>P2P-GROUP-REMOVED p2p-wlan0-0"));
        assert!(s.group("p2p-wlan0-0").is_none());
        let peer = s.link().peer("02:aa:bb:cc:dd:ee").expect("peer");
        assert!(!peer.connected);
        assert!(s.drain_events().contains(&WifiEvent::ConnectedChanged {
            link: 3,
            mac: "02:aa:bb:cc:dd:ee".into(),
            connected: false
        }));
    }

    #[test]
    fn formation_failure_clears_single_pending() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();

        s.pending = Some("02:aa:bb:cc:dd:ee".into());
        s.handle_event(&ev("<3>P2P-GO-NEG-FAILURE status=1"));

        assert!(s.pending.is_none());
        assert!(s.drain_events().iter().any(|e| matches!(
            e,
            WifiEvent::FormationFailure {
                reason: "group owner negotiation failed",
                ..
            }
        )));

        // No pending, no event.
        s.handle_event(&ev("<3>P2P-GROUP-FORMATION-FAILURE"));
        assert!(s.drain_events().is_empty());
    }

    #[test]
    fn commands_require_ready_state() {
        let (mut s, _rx) = test_supplicant();
        assert!(matches!(s.start_scan(), Err(WifiError::NotReady)));
        assert!(matches!(s.stop_scan(), Err(WifiError::NotReady)));
        assert!(matches!(
            s.connect("02:aa:bb:cc:dd:ee", None, None),
            Err(WifiError::NotReady)
        ));
        assert!(matches!(
            s.set_friendly_name("TestCast"),
            Err(WifiError::NotReady)
        ));
    }

    #[test]
    fn restart_throttle_schedule() {
        // Seed scenario 5: two quick restarts, then the cool-down.
        let (mut s, _rx) = test_supplicant();
        let t0 = Instant::now();

        s.failed(t0);
        assert_eq!(s.next_deadline(), Some(t0 + RESTART_GRACE));

        s.failed(t0 + Duration::from_secs(1));
        assert_eq!(
            s.next_deadline(),
            Some(t0 + Duration::from_secs(1) + RESTART_GRACE)
        );

        s.failed(t0 + Duration::from_secs(2));
        assert_eq!(
            s.next_deadline(),
            Some(t0 + Duration::from_secs(2) + RESTART_COOLDOWN)
        );
    }

    #[test]
    fn second_connect_fails_with_already() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();
        s.state = SupplicantState::Ready;

        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee"));
        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:11:22:33:44:55 p2p_dev_addr=02:11:22:33:44:55"));
        s.pending = Some("02:aa:bb:cc:dd:ee".into());

        match s.connect("02:11:22:33:44:55", Some(Provision::Pbc), None) {
            Err(WifiError::Already) => {}
            other => panic!("expected Already, got {other:?}"),
        }
    }

    #[test]
    fn ap_sta_connected_binds_to_event_ifname_group() {
        let (mut s, _rx) = test_supplicant();
        let now = Instant::now();

        // Local group without a selected peer (we are GO).
        s.p2p_mac = Some("02:de:ad:be:ef:00".into());
        s.handle_event(
            &ev("<3>P2P-GROUP-STARTED p2p-wlan0-0 GO go_dev_addr=02:de:ad:be:ef:00"));
        s.handle_event(
            &ev("<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee"));
        s.handle_event(
            &ev("IFNAME=p2p-wlan0-0 <3>AP-STA-CONNECTED 06:aa:bb:cc:dd:ee \
                 p2p_dev_addr=02:aa:bb:cc:dd:ee"));

        let peer = s.link().peer("02:aa:bb:cc:dd:ee").expect("peer");
        assert_eq!(peer.group.as_deref(), Some("p2p-wlan0-0"));
        assert_eq!(peer.sta_mac.as_deref(), Some("06:aa:bb:cc:dd:ee"));

        // Lease for the station MAC connects the peer.
        s.handle_dhcp_line("p2p-wlan0-0", "L:192.168.50.1");
        s.handle_dhcp_line("p2p-wlan0-0", "R:06:aa:bb:cc:dd:ee 192.168.50.20");
        assert!(s.link().peer("02:aa:bb:cc:dd:ee").expect("peer").connected);
    }
}
