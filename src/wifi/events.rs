//! Facade-bound events of the Wi-Fi layer.
//!
//! Supplicant event handlers mutate the in-memory model and enqueue these
//! values; the manager drains the queue once the current control-socket
//! event is fully processed. Nothing in here calls back into the model.

use std::fmt;

/// WPS provisioning flavor cached on a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
    Pbc,
    Display,
    Pin,
    Keypad,
}

impl std::str::FromStr for Provision {
    type Err = crate::wifi::wifi_error::WifiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pbc" => Ok(Self::Pbc),
            "display" => Ok(Self::Display),
            "pin" => Ok(Self::Pin),
            "keypad" => Ok(Self::Keypad),
            _ => Err(crate::wifi::wifi_error::WifiError::InvalidArgument(
                "unknown provision type",
            )),
        }
    }
}

impl fmt::Display for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pbc => "pbc",
            Self::Display => "display",
            Self::Pin => "pin",
            Self::Keypad => "keypad",
        })
    }
}

/// One event per observable model change, keyed by link ifindex and the
/// peer's canonical P2P device address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    LinkStarted {
        link: u32,
    },
    LinkStopped {
        link: u32,
    },
    ScanChanged {
        link: u32,
        scanning: bool,
    },
    PeerFound {
        link: u32,
        mac: String,
    },
    PeerLost {
        link: u32,
        mac: String,
    },
    PeerFriendlyNameChanged {
        link: u32,
        mac: String,
    },
    PeerSubelementsChanged {
        link: u32,
        mac: String,
    },
    ProvisionDiscovery {
        link: u32,
        mac: String,
        prov: Provision,
        pin: Option<String>,
    },
    GoNegRequest {
        link: u32,
        mac: String,
        prov: Provision,
        pin: Option<String>,
    },
    FormationFailure {
        link: u32,
        mac: String,
        reason: &'static str,
    },
    ConnectedChanged {
        link: u32,
        mac: String,
        connected: bool,
    },
}
