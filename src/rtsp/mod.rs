pub mod bus;
pub mod chain;
pub mod connection;
pub mod header;
pub mod message;
pub mod parser;
pub mod rtsp_error;
pub mod status;

pub use bus::{BusEvent, RtspBus};
pub use chain::{MatchChain, MatchResult};
pub use header::Header;
pub use message::{Message, MessageKind, REMOTE_COOKIE_FLAG};
pub use parser::Parser;
pub use rtsp_error::RtspError;
