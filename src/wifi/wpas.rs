//! Line/datagram protocol of the external P2P supplicant control socket.
//!
//! Every datagram is either an unsolicited event (prefixed with a
//! `<priority>` marker) or the reply to the oldest outstanding request;
//! the control interface answers strictly in order. Event lines carry a
//! name, positional arguments and `key=value` pairs whose values may be
//! quoted with `'` or `"` and contain spaces. Replies are free-form text;
//! `OK` / `FAIL` classify command results, everything else is payload
//! (the STATUS and P2P_PEER reports are `key=value` lines).

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use rand::{RngCore, rngs::OsRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpasKind {
    /// Unsolicited `<N>`-prefixed event.
    Event { priority: u8 },
    /// Reply to the oldest pending request.
    Reply,
}

/// One parsed control-interface datagram.
#[derive(Debug, Clone)]
pub struct WpasMessage {
    kind: WpasKind,
    ifname: Option<String>,
    name: String,
    args: Vec<String>,
    dict: Vec<(String, String)>,
    raw: String,
}

impl WpasMessage {
    /// Parse one received datagram.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut rest = raw.trim_end_matches(['\r', '\n']);
        let mut ifname = None;

        if let Some(r) = rest.strip_prefix("IFNAME=") {
            match r.split_once(' ') {
                Some((name, tail)) => {
                    ifname = Some(name.to_string());
                    rest = tail;
                }
                None => {
                    ifname = Some(r.to_string());
                    rest = "";
                }
            }
        }

        let kind = match parse_priority(rest) {
            Some((prio, tail)) => {
                rest = tail;
                WpasKind::Event { priority: prio }
            }
            None => WpasKind::Reply,
        };

        let mut name = String::new();
        let mut args = Vec::new();
        let mut dict = Vec::new();

        for line in rest.lines() {
            for token in tokenize(line) {
                match split_dict(&token) {
                    Some((k, v)) => dict.push((k, v)),
                    None => {
                        if name.is_empty() && matches!(kind, WpasKind::Event { .. }) {
                            name = token;
                        } else {
                            args.push(token);
                        }
                    }
                }
            }
        }

        Self {
            kind,
            ifname,
            name,
            args,
            dict,
            raw: raw.to_string(),
        }
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self.kind, WpasKind::Event { .. })
    }

    /// Command accepted.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.raw.trim() == "OK"
    }

    /// Command rejected (also ends `P2P_PEER NEXT-` enumeration).
    #[must_use]
    pub fn is_fail(&self) -> bool {
        self.raw.trim_start().starts_with("FAIL")
    }

    /// Event name (`P2P-DEVICE-FOUND`, ...); empty for replies.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ifname(&self) -> Option<&str> {
        self.ifname.as_deref()
    }

    /// Positional argument by index.
    #[must_use]
    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(String::as_str)
    }

    /// First matching `key=value` entry.
    #[must_use]
    pub fn dict(&self, key: &str) -> Option<&str> {
        self.dict
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn parse_priority(s: &str) -> Option<(u8, &str)> {
    let rest = s.strip_prefix('<')?;
    let end = rest.find('>')?;
    let prio = rest[..end].parse::<u8>().ok()?;
    Some((prio, &rest[end + 1..]))
}

/// Whitespace split honoring `'...'` and `"..."` runs.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    cur.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                ' ' | '\t' => {
                    if !cur.is_empty() {
                        tokens.push(std::mem::take(&mut cur));
                    }
                }
                _ => cur.push(ch),
            },
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

/// `key=value` classification; a key is a plain identifier, so tokens
/// like `02:ab:cd=..` or bare MACs stay positional.
fn split_dict(token: &str) -> Option<(String, String)> {
    let pos = token.find('=')?;
    let key = &token[..pos];
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((key.to_string(), token[pos + 1..].to_string()))
}

/// Render a request line: name plus space-joined arguments.
#[must_use]
pub fn request_line(name: &str, args: &[&str]) -> String {
    let mut line = String::from(name);
    for a in args {
        line.push(' ');
        line.push_str(a);
    }
    line
}

/// One bound control socket. The supplicant answers on the same socket
/// the request came from, so each channel keeps its own private client
/// path under the control directory.
#[derive(Debug)]
pub struct WpasSocket {
    sock: UnixDatagram,
    local_path: PathBuf,
}

impl WpasSocket {
    /// Bind a private client socket and connect it to `ctrl_path`.
    ///
    /// # Errors
    /// Propagates bind/connect failures; `ENOENT`/`ECONNREFUSED` simply
    /// mean the supplicant is not up yet.
    pub fn open(ctrl_path: &Path, client_dir: &Path) -> io::Result<Self> {
        let suffix = OsRng.next_u32();
        let local_path =
            client_dir.join(format!("client-{}-{:08x}", std::process::id(), suffix));

        let sock = UnixDatagram::bind(&local_path)?;
        if let Err(e) = sock.connect(ctrl_path) {
            let _ = std::fs::remove_file(&local_path);
            return Err(e);
        }

        Ok(Self { sock, local_path })
    }

    /// # Errors
    /// Propagates the send failure.
    pub fn send(&self, line: &str) -> io::Result<()> {
        self.sock.send(line.as_bytes()).map(|_| ())
    }

    /// Spawn the reader thread forwarding datagrams to the owning loop.
    /// Raising `stop` makes the thread exit silently at its next wakeup;
    /// a socket error while `stop` is clear is reported as a HUP.
    ///
    /// # Errors
    /// Fails when the socket cannot be cloned for the thread.
    pub fn spawn_reader<E, F>(
        &self,
        stop: Arc<AtomicBool>,
        to_owner: mpsc::Sender<E>,
        wrap: F,
    ) -> io::Result<()>
    where
        E: Send + 'static,
        F: Fn(WpasIo) -> E + Send + 'static,
    {
        let sock = self.sock.try_clone()?;
        sock.set_read_timeout(Some(Duration::from_millis(500)))?;
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match sock.recv(&mut buf) {
                    Ok(0) => {
                        let _ = to_owner.send(wrap(WpasIo::Hup));
                        break;
                    }
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if to_owner.send(wrap(WpasIo::Datagram(text))).is_err() {
                            break;
                        }
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut
                            || e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => {
                        if !stop.load(Ordering::Relaxed) {
                            let _ = to_owner.send(wrap(WpasIo::Hup));
                        }
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

impl Drop for WpasSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}

#[derive(Debug)]
pub enum WpasIo {
    Datagram(String),
    Hup,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn parses_device_found_event() {
        let m = WpasMessage::parse(
            "<3>P2P-DEVICE-FOUND 02:aa:bb:cc:dd:ee p2p_dev_addr=02:aa:bb:cc:dd:ee \
             pri_dev_type=1-0050F204-1 name='Living Room TV' config_methods=0x188 \
             dev_capab=0x25 group_capab=0x0 wfd_dev_info=0x00061c440032",
        );

        assert!(m.is_event());
        assert_eq!(m.name(), "P2P-DEVICE-FOUND");
        assert_eq!(m.arg(0), Some("02:aa:bb:cc:dd:ee"));
        assert_eq!(m.dict("p2p_dev_addr"), Some("02:aa:bb:cc:dd:ee"));
        assert_eq!(m.dict("name"), Some("Living Room TV"));
    }

    #[test]
    fn parses_group_started_event() {
        let m = WpasMessage::parse(
            "<3>P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-ab\" freq=2437 \
             passphrase=\"secret\" go_dev_addr=02:aa:bb:cc:dd:ee",
        );
        assert_eq!(m.name(), "P2P-GROUP-STARTED");
        assert_eq!(m.arg(0), Some("p2p-wlan0-0"));
        assert_eq!(m.arg(1), Some("GO"));
        assert_eq!(m.dict("go_dev_addr"), Some("02:aa:bb:cc:dd:ee"));
    }

    #[test]
    fn classifies_replies() {
        assert!(WpasMessage::parse("OK\n").is_ok());
        assert!(WpasMessage::parse("FAIL").is_fail());
        assert!(WpasMessage::parse("FAIL-BUSY").is_fail());
        assert!(!WpasMessage::parse("OK\n").is_event());
    }

    #[test]
    fn parses_multiline_status_reply() {
        let m = WpasMessage::parse(
            "bssid=aa:bb:cc:dd:ee:ff\np2p_state=IDLE\nwifi_display=1\n\
             p2p_device_address=02:aa:bb:cc:dd:ee\n",
        );
        assert!(!m.is_event());
        assert_eq!(m.dict("p2p_state"), Some("IDLE"));
        assert_eq!(m.dict("wifi_display"), Some("1"));
        assert_eq!(m.dict("p2p_device_address"), Some("02:aa:bb:cc:dd:ee"));
    }

    #[test]
    fn ifname_prefix_is_stripped() {
        let m = WpasMessage::parse("IFNAME=p2p-dev-wlan0 <3>AP-STA-CONNECTED 06:aa:bb:cc:dd:ee \
             p2p_dev_addr=02:aa:bb:cc:dd:ee");
        assert_eq!(m.ifname(), Some("p2p-dev-wlan0"));
        assert_eq!(m.name(), "AP-STA-CONNECTED");
        assert_eq!(m.arg(0), Some("06:aa:bb:cc:dd:ee"));
    }

    #[test]
    fn request_line_joins_args() {
        assert_eq!(
            request_line("P2P_CONNECT", &["02:aa:bb:cc:dd:ee", "pbc"]),
            "P2P_CONNECT 02:aa:bb:cc:dd:ee pbc"
        );
        assert_eq!(request_line("P2P_FIND", &[]), "P2P_FIND");
    }
}
