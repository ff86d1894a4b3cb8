use crate::wifi::events::Provision;

/// A discovered P2P peer. Cross-references to its group are by ifname id,
/// never by handle, so the peer map and group list stay independently
/// mutable.
#[derive(Debug, Default)]
pub struct Peer {
    /// Canonical (lower-case) P2P device address. Map key and identity.
    pub p2p_mac: String,
    pub friendly_name: Option<String>,
    /// Raw concatenated WFD sub-element hex string as reported by the
    /// supplicant; parsed on demand by the wfd layer.
    pub wfd_subelements: Option<String>,
    /// Cached provisioning hint from the last PROV-DISC/GO-NEG exchange.
    pub prov: Option<Provision>,
    pub pin: Option<String>,
    /// Station MAC once GO negotiation or AP-STA events revealed it.
    pub sta_mac: Option<String>,
    /// IPv4 of the peer once the DHCP helper reported it.
    pub remote_addr: Option<String>,
    /// Group binding (ifname id).
    pub group: Option<String>,
    pub connected: bool,
}

impl Peer {
    #[must_use]
    pub fn new(p2p_mac: &str) -> Self {
        Self {
            p2p_mac: normalize_mac(p2p_mac),
            ..Self::default()
        }
    }

    /// Match by P2P device address or station address.
    #[must_use]
    pub fn has_mac(&self, mac: &str) -> bool {
        let mac = normalize_mac(mac);
        self.p2p_mac == mac || self.sta_mac.as_deref() == Some(mac.as_str())
    }

    /// Display name: friendly name when known, address otherwise.
    #[must_use]
    pub fn name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.p2p_mac)
    }
}

/// Canonical MAC form: lower-case hex, colon separated.
#[must_use]
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_matching_covers_station_address() {
        let mut p = Peer::new("02:AA:BB:CC:DD:EE");
        assert_eq!(p.p2p_mac, "02:aa:bb:cc:dd:ee");
        assert!(p.has_mac("02:aa:bb:cc:dd:ee"));
        assert!(!p.has_mac("06:aa:bb:cc:dd:ee"));

        p.sta_mac = Some("06:aa:bb:cc:dd:ee".into());
        assert!(p.has_mac("06:AA:BB:CC:DD:EE"));
    }
}
