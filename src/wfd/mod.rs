pub mod dispatch;
pub mod formats;
pub mod out_session;
pub mod session;
pub mod sink;
pub mod sube;
pub mod wfd_error;

pub use dispatch::{MessageId, TriggerMethod};
pub use session::{SessionDir, SessionState, WfdEvent, WfdSession};
pub use sink::WfdSink;
pub use wfd_error::WfdError;
