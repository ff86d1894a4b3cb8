//! RustyCast is a Wi-Fi Display (Miracast) session control plane for
//! Linux.
//!
//! It discovers Wi-Fi Direct peers through an external P2P supplicant,
//! forms groups with DHCP-helper children, and negotiates RTSP
//! streaming sessions (M1–M16) in which an external encoder child
//! produces the MPEG-TS/RTP stream. The daemon binary is `rustycastd`.
//!
//! The crate is structured into one module per subsystem; worker
//! threads feed a single manager loop over channels, so the model is
//! mutated from exactly one thread.

/// Handles configuration loading and management.
pub mod config;
/// Process-wide state and the central event loop.
pub mod core;
/// Supervision of the external media encoder child.
pub mod encoder;
/// Logging utilities for the daemon.
pub mod log;
/// Child process helpers shared by the supervisors.
pub mod proc;
/// RTSP/1.0 codec, wire parser and call-tracking bus.
pub mod rtsp;
/// Miracast session state machine and WFD capability descriptors.
pub mod wfd;
/// P2P supplicant control, link/peer/group model and DHCP helpers.
pub mod wifi;
