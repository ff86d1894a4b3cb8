//! P2P groups and their DHCP helper child.
//!
//! A group exists from `P2P-GROUP-STARTED` until its refcount drops to
//! zero or the helper dies. On the GO side the group owns a /24 out of
//! `192.168.50/24 .. 192.168.255/24`, unique among the live groups of the
//! same supplicant, and runs the helper as a server; clients run it in
//! client mode. The helper reports line events on its stdout:
//!
//! - `L:<addr>` local address assigned on the interface
//! - `G:<addr>` remote (GO) address, client side
//! - `R:<mac> <addr>` lease handed to a station
//!
//! which the supplicant folds into the peer model.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;

use crate::log::LogLevel;
use crate::proc;
use crate::wifi::wifi_error::WifiError;

pub const SUBNET_FIRST: u8 = 50;

#[derive(Debug)]
pub struct Group {
    /// Ephemeral interface name; group identity.
    pub ifname: String,
    /// This side is the Group Owner.
    pub go: bool,
    /// Third octet of the served /24, GO side only.
    pub subnet: Option<u8>,
    pub local_addr: Option<String>,
    /// Selected peer (P2P device address) for client-side groups.
    pub peer: Option<String>,
    /// Bound-peer refcount; the group is freed when it reaches zero.
    pub users: u32,
    dhcp: Option<Child>,
}

impl Group {
    #[must_use]
    pub fn new(ifname: &str, go: bool) -> Self {
        Self {
            ifname: ifname.to_string(),
            go,
            subnet: None,
            local_addr: None,
            peer: None,
            users: 0,
            dhcp: None,
        }
    }

    /// First free /24 id among `used`, in `[SUBNET_FIRST, 255]`.
    #[must_use]
    pub fn allocate_subnet(used: &[u8]) -> Option<u8> {
        (SUBNET_FIRST..=u8::MAX).find(|n| !used.contains(n))
    }

    /// Helper argv (without the binary), as handed to the child.
    #[must_use]
    pub fn dhcp_argv(&self, log_level: LogLevel) -> Vec<String> {
        let mut argv = Vec::new();
        if self.go {
            argv.push("--server".to_string());
            argv.push("--prefix".to_string());
            argv.push(format!("192.168.{}", self.subnet.unwrap_or(SUBNET_FIRST)));
        }
        argv.push("--log-level".to_string());
        argv.push(format!("{log_level:?}").to_ascii_lowercase());
        argv.push("--netdev".to_string());
        argv.push(self.ifname.clone());
        argv
    }

    /// Spawn the helper and its stdout reader thread. Line events and the
    /// final exit notification are wrapped into the owner's event type.
    ///
    /// # Errors
    /// `Spawn` when the helper binary cannot be executed.
    pub fn spawn_dhcp<E, F>(
        &mut self,
        binary: &str,
        log_level: LogLevel,
        to_owner: mpsc::Sender<E>,
        wrap: F,
    ) -> Result<(), WifiError>
    where
        E: Send + 'static,
        F: Fn(DhcpIo) -> E + Send + 'static,
    {
        let mut child = Command::new(binary)
            .args(self.dhcp_argv(log_level))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(WifiError::Spawn)?;

        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if to_owner.send(wrap(DhcpIo::Line(line))).is_err() {
                                return;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let _ = to_owner.send(wrap(DhcpIo::Exited));
            });
        }

        self.dhcp = Some(child);
        Ok(())
    }

    /// SIGTERM the helper and reap it.
    pub fn stop_dhcp(&mut self) {
        if let Some(mut child) = self.dhcp.take() {
            proc::terminate(&mut child);
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.stop_dhcp();
    }
}

/// Stdout events of one DHCP helper.
#[derive(Debug)]
pub enum DhcpIo {
    Line(String),
    Exited,
}

/// One parsed helper line.
#[derive(Debug, PartialEq, Eq)]
pub enum DhcpLine<'a> {
    Local(&'a str),
    Gateway(&'a str),
    Lease { mac: &'a str, addr: &'a str },
}

impl<'a> DhcpLine<'a> {
    /// # Errors
    /// Lines that are not `L:`/`G:`/`R:` records.
    pub fn parse(line: &'a str) -> Result<Self, WifiError> {
        let (tag, rest) = line
            .split_once(':')
            .ok_or(WifiError::Parse("dhcp line without tag"))?;
        if rest.is_empty() {
            return Err(WifiError::Parse("dhcp line without payload"));
        }
        match tag {
            "L" => Ok(Self::Local(rest)),
            "G" => Ok(Self::Gateway(rest)),
            "R" => {
                let (mac, addr) = rest
                    .split_once(' ')
                    .ok_or(WifiError::Parse("dhcp 'R' line without address"))?;
                if mac.is_empty() || addr.is_empty() {
                    return Err(WifiError::Parse("dhcp 'R' line without address"));
                }
                Ok(Self::Lease { mac, addr })
            }
            _ => Err(WifiError::Parse("unknown dhcp line tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn subnets_allocate_from_50_upwards() {
        // Seed scenario 6: four groups back to back.
        let mut used = Vec::new();
        for expected in [50u8, 51, 52, 53] {
            let n = Group::allocate_subnet(&used).expect("free subnet");
            assert_eq!(n, expected);
            used.push(n);
        }
    }

    #[test]
    fn subnet_allocation_skips_holes_and_exhausts() {
        assert_eq!(Group::allocate_subnet(&[50, 52]), Some(51));
        let all: Vec<u8> = (50..=u8::MAX).collect();
        assert_eq!(Group::allocate_subnet(&all), None);
    }

    #[test]
    fn go_argv_carries_prefix() {
        let mut g = Group::new("p2p-wlan0-0", true);
        g.subnet = Some(50);
        let argv = g.dhcp_argv(LogLevel::Info);
        assert_eq!(
            argv,
            vec![
                "--server",
                "--prefix",
                "192.168.50",
                "--log-level",
                "info",
                "--netdev",
                "p2p-wlan0-0"
            ]
        );
    }

    #[test]
    fn client_argv_has_no_server_flags() {
        let g = Group::new("p2p-wlan0-0", false);
        let argv = g.dhcp_argv(LogLevel::Info);
        assert!(!argv.contains(&"--server".to_string()));
        assert!(!argv.iter().any(|a| a == "--prefix"));
    }

    #[test]
    fn dhcp_lines_parse() {
        assert_eq!(
            DhcpLine::parse("L:192.168.50.1").expect("parses"),
            DhcpLine::Local("192.168.50.1")
        );
        assert_eq!(
            DhcpLine::parse("G:192.168.50.1").expect("parses"),
            DhcpLine::Gateway("192.168.50.1")
        );
        assert_eq!(
            DhcpLine::parse("R:06:aa:bb:cc:dd:ee 192.168.50.77").expect("parses"),
            DhcpLine::Lease {
                mac: "06:aa:bb:cc:dd:ee",
                addr: "192.168.50.77"
            }
        );
        assert!(DhcpLine::parse("X:1.2.3.4").is_err());
        assert!(DhcpLine::parse("R:06:aa:bb:cc:dd:ee").is_err());
        assert!(DhcpLine::parse("nonsense").is_err());
    }
}
