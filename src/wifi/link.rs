use std::collections::HashMap;

use crate::wifi::peer::{Peer, normalize_mac};

/// One managed radio interface and its discovered peers.
#[derive(Debug, Default)]
pub struct Link {
    /// Kernel interface index; link identity.
    pub ifindex: u32,
    pub ifname: String,
    /// Name advertised to peers over WPS.
    pub friendly_name: Option<String>,
    pub managed: bool,
    /// Concatenated WFD sub-element hex string advertised on this link.
    pub wfd_subelements: Option<String>,
    /// WPS config methods written into the supplicant config.
    pub config_methods: Option<String>,
    peers: HashMap<String, Peer>,
}

impl Link {
    #[must_use]
    pub fn new(ifindex: u32, ifname: &str) -> Self {
        Self {
            ifindex,
            ifname: ifname.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn peer(&self, p2p_mac: &str) -> Option<&Peer> {
        self.peers.get(&normalize_mac(p2p_mac))
    }

    pub fn peer_mut(&mut self, p2p_mac: &str) -> Option<&mut Peer> {
        self.peers.get_mut(&normalize_mac(p2p_mac))
    }

    /// Find by P2P device address or by station address.
    pub fn peer_by_any_mac_mut(&mut self, mac: &str) -> Option<&mut Peer> {
        self.peers.values_mut().find(|p| p.has_mac(mac))
    }

    /// Insert-or-get for supplicant peer reports.
    pub fn upsert_peer(&mut self, p2p_mac: &str) -> (&mut Peer, bool) {
        let key = normalize_mac(p2p_mac);
        let fresh = !self.peers.contains_key(&key);
        let peer = self
            .peers
            .entry(key.clone())
            .or_insert_with(|| Peer::new(&key));
        (peer, fresh)
    }

    pub fn remove_peer(&mut self, p2p_mac: &str) -> Option<Peer> {
        self.peers.remove(&normalize_mac(p2p_mac))
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn clear_peers(&mut self) -> Vec<String> {
        let macs: Vec<String> = self.peers.keys().cloned().collect();
        self.peers.clear();
        macs
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_is_idempotent_and_canonical() {
        let mut l = Link::new(3, "wlan0");
        let (_, fresh) = l.upsert_peer("02:AA:BB:CC:DD:EE");
        assert!(fresh);
        let (_, fresh) = l.upsert_peer("02:aa:bb:cc:dd:ee");
        assert!(!fresh);
        assert_eq!(l.peer_count(), 1);
        assert!(l.peer("02:aa:BB:cc:dd:ee").is_some());
    }

    #[test]
    fn any_mac_lookup_uses_station_address() {
        let mut l = Link::new(3, "wlan0");
        l.upsert_peer("02:aa:bb:cc:dd:ee");
        if let Some(p) = l.peer_mut("02:aa:bb:cc:dd:ee") {
            p.sta_mac = Some("06:aa:bb:cc:dd:ee".into());
        }
        assert!(l.peer_by_any_mac_mut("06:aa:bb:cc:dd:ee").is_some());
        assert!(l.peer_by_any_mac_mut("06:11:22:33:44:55").is_none());
    }
}
