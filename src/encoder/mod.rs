//! Supervisor for the external media encoder child.
//!
//! The encoder is spawned per Source session. It announces itself with
//! two lines on stdout (its well-known name, then the path of its
//! private control socket) and keeps running. The supervisor connects to
//! that socket, drives it with `CONFIGURE`/`START`/`PAUSE`/`STOP` lines
//! and folds the child's `STATE <n>` notifications into
//! [`EncoderState`], which the owning session observes to advance its
//! own Playing/Paused states. `stop` arms a one-second terminator; if
//! the child still lives when it fires, it is SIGKILLed.

pub mod encoder_error;

pub use encoder_error::EncoderError;

use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::proc;

const KILL_DELAY: Duration = Duration::from_secs(1);

/// Encoder lifecycle as reported on the control channel. `Spawned` is
/// local to the supervisor; the wire carries 0..5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncoderState {
    Null,
    Spawned,
    Configured,
    Ready,
    Started,
    Paused,
    Terminated,
}

impl EncoderState {
    #[must_use]
    pub fn from_wire(n: u32) -> Option<Self> {
        match n {
            0 => Some(Self::Null),
            1 => Some(Self::Configured),
            2 => Some(Self::Ready),
            3 => Some(Self::Started),
            4 => Some(Self::Paused),
            5 => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// I/O of one encoder child, tagged with the owning session id.
#[derive(Debug)]
pub enum EncoderIo {
    /// A line from the child's stdout (handshake) or control socket.
    Line(String),
    /// Stdout or control socket closed; the child is gone or going.
    Hup,
}

/// Stream configuration handed to the child before `START`.
#[derive(Debug, Clone, Default)]
pub struct EncoderConfig {
    pub local_address: Option<String>,
    pub peer_address: Option<String>,
    pub rtp_port0: u16,
    pub rtp_port1: u16,
    pub local_rtp_port: u16,
    pub local_rtcp_port: u16,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub audio_dev: Option<String>,
}

impl EncoderConfig {
    fn to_line(&self) -> String {
        let mut line = String::from("CONFIGURE");
        if let Some(a) = &self.local_address {
            let _ = write!(line, " local_address={a}");
        }
        if let Some(a) = &self.peer_address {
            let _ = write!(line, " peer_address={a}");
        }
        let _ = write!(
            line,
            " rtp_port0={} rtp_port1={} local_rtp_port={} local_rtcp_port={}",
            self.rtp_port0, self.rtp_port1, self.local_rtp_port, self.local_rtcp_port
        );
        let _ = write!(
            line,
            " x={} y={} width={} height={}",
            self.x, self.y, self.width, self.height
        );
        if let Some(dev) = &self.audio_dev {
            let _ = write!(line, " audio_dev={dev}");
        }
        line
    }
}

pub struct Encoder {
    session: u32,
    child: Option<Child>,
    state: EncoderState,
    name: Option<String>,
    ctrl: Option<UnixStream>,
    handshake: Vec<String>,
    kill_deadline: Option<Instant>,
    tx: mpsc::Sender<(u32, EncoderIo)>,
}

impl Encoder {
    /// Fork the encoder child and watch its stdout for the two-line
    /// handshake.
    ///
    /// # Errors
    /// Spawn failure (missing binary, permissions).
    pub fn spawn(
        session: u32,
        binary: &str,
        tx: mpsc::Sender<(u32, EncoderIo)>,
    ) -> Result<Self, EncoderError> {
        let mut child = Command::new(binary)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if tx.send((session, EncoderIo::Line(line))).is_err() {
                                return;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let _ = tx.send((session, EncoderIo::Hup));
            });
        }

        Ok(Self {
            session,
            child: Some(child),
            state: EncoderState::Null,
            name: None,
            ctrl: None,
            handshake: Vec::new(),
            kill_deadline: None,
            tx,
        })
    }

    #[must_use]
    pub fn state(&self) -> EncoderState {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Feed one I/O event; returns the new state when it changed, which
    /// the session observer consumes.
    pub fn handle_io(&mut self, io: EncoderIo, _now: Instant) -> Option<EncoderState> {
        match io {
            EncoderIo::Line(line) => self.handle_line(&line),
            EncoderIo::Hup => {
                // Stop path: the child closing its end is expected and
                // already accounted for by the terminator.
                if self.kill_deadline.is_none() && self.state != EncoderState::Terminated {
                    self.reap();
                    return self.set_state(EncoderState::Terminated);
                }
                None
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Option<EncoderState> {
        if self.ctrl.is_none() {
            // Two-line handshake: well-known name, control socket path.
            self.handshake.push(line.to_string());
            if self.handshake.len() < 2 {
                return None;
            }
            let name = self.handshake.remove(0);
            let path = self.handshake.remove(0);
            return match self.connect_ctrl(&path) {
                Ok(()) => {
                    self.name = Some(name);
                    self.set_state(EncoderState::Spawned)
                }
                Err(_) => {
                    self.kill();
                    self.set_state(EncoderState::Terminated)
                }
            };
        }

        // Control channel: `STATE <n>`.
        if let Some(n) = line.strip_prefix("STATE ")
            && let Some(state) = n.trim().parse::<u32>().ok().and_then(EncoderState::from_wire)
        {
            return self.set_state(state);
        }
        None
    }

    fn connect_ctrl(&mut self, path: &str) -> Result<(), EncoderError> {
        let stream = UnixStream::connect(path)?;
        let reader = stream.try_clone()?;
        let session = self.session;
        let tx = self.tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send((session, EncoderIo::Line(line))).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = tx.send((session, EncoderIo::Hup));
        });
        self.ctrl = Some(stream);
        Ok(())
    }

    fn set_state(&mut self, state: EncoderState) -> Option<EncoderState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn send_line(&mut self, line: &str) -> Result<(), EncoderError> {
        let Some(ctrl) = self.ctrl.as_mut() else {
            return Err(EncoderError::NotConnected);
        };
        ctrl.write_all(line.as_bytes())?;
        ctrl.write_all(b"\n")?;
        Ok(())
    }

    /// # Errors
    /// `NotConnected` before the handshake, I/O errors after.
    pub fn configure(&mut self, cfg: &EncoderConfig) -> Result<(), EncoderError> {
        self.send_line(&cfg.to_line())
    }

    /// # Errors
    /// `NotConnected` before the handshake, I/O errors after.
    pub fn start(&mut self) -> Result<(), EncoderError> {
        self.send_line("START")
    }

    /// # Errors
    /// `NotConnected` before the handshake, I/O errors after.
    pub fn pause(&mut self) -> Result<(), EncoderError> {
        self.send_line("PAUSE")
    }

    /// Ask the child to stop and arm the SIGKILL terminator.
    pub fn stop(&mut self, now: Instant) {
        let _ = self.send_line("STOP");
        self.kill_deadline = Some(now + KILL_DELAY);
    }

    /// The terminator deadline, if armed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.kill_deadline
    }

    /// Fire the terminator: SIGKILL the child if it still holds on.
    pub fn on_tick(&mut self, now: Instant) -> Option<EncoderState> {
        let due = self.kill_deadline.is_some_and(|d| d <= now);
        if !due {
            return None;
        }
        self.kill_deadline = None;
        self.kill();
        self.set_state(EncoderState::Terminated)
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                proc::sigkill(child.id());
            }
            let _ = child.wait();
        }
        self.ctrl = None;
    }

    fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        self.ctrl = None;
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            proc::terminate(&mut child);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn wire_states_map_per_contract() {
        assert_eq!(EncoderState::from_wire(0), Some(EncoderState::Null));
        assert_eq!(EncoderState::from_wire(1), Some(EncoderState::Configured));
        assert_eq!(EncoderState::from_wire(2), Some(EncoderState::Ready));
        assert_eq!(EncoderState::from_wire(3), Some(EncoderState::Started));
        assert_eq!(EncoderState::from_wire(4), Some(EncoderState::Paused));
        assert_eq!(EncoderState::from_wire(5), Some(EncoderState::Terminated));
        assert_eq!(EncoderState::from_wire(6), None);
    }

    #[test]
    fn configured_orders_after_spawned() {
        assert!(EncoderState::Configured >= EncoderState::Spawned);
        assert!(EncoderState::Started > EncoderState::Configured);
    }

    #[test]
    fn configure_line_carries_endpoints() {
        let cfg = EncoderConfig {
            local_address: Some("192.168.50.1".into()),
            peer_address: Some("192.168.50.77".into()),
            rtp_port0: 1991,
            rtp_port1: 0,
            local_rtp_port: 16384,
            local_rtcp_port: 16385,
            width: 1920,
            height: 1080,
            ..EncoderConfig::default()
        };
        let line = cfg.to_line();
        assert!(line.starts_with("CONFIGURE "));
        assert!(line.contains("local_address=192.168.50.1"));
        assert!(line.contains("peer_address=192.168.50.77"));
        assert!(line.contains("rtp_port0=1991"));
        assert!(line.contains("local_rtp_port=16384"));
        assert!(line.contains("width=1920 height=1080"));
    }
}
