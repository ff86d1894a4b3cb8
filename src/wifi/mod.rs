pub mod events;
pub mod group;
pub mod link;
pub mod peer;
pub mod ratelimit;
pub mod supplicant;
pub mod wifi_error;
pub mod wpas;

pub use events::{Provision, WifiEvent};
pub use group::Group;
pub use link::Link;
pub use peer::Peer;
pub use supplicant::{Supplicant, SupplicantConfig, SupplicantState};
pub use wifi_error::WifiError;
