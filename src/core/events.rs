//! The single event type of the daemon loop.
//!
//! Every worker thread (control-socket readers, DHCP/encoder stdout
//! readers, RTSP connection threads, listener accept threads) forwards
//! into one channel of these; the manager loop is the only consumer and
//! the only mutator of the model.

use std::net::TcpStream;

use crate::encoder::EncoderIo;
use crate::rtsp::connection::ConnEvent;
use crate::wifi::supplicant::WifiIoEvent;

#[derive(Debug)]
pub enum ManagerEvent {
    /// Supplicant or DHCP helper I/O, tagged by link.
    Wifi(WifiIoEvent),
    /// Encoder child I/O, tagged by session.
    Encoder { session: u32, io: EncoderIo },
    /// The session's listener accepted the sink's connection.
    SessionAccept { session: u32, stream: TcpStream },
    /// RTSP connection traffic, tagged by session.
    SessionConn { session: u32, ev: ConnEvent },
    /// Clean shutdown requested.
    Shutdown,
}
