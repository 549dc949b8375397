//! Array Controller Library
//!
//! Drives a set of array boards over serial: opens one channel per board,
//! waits for every board to report ready, then fans operator commands out to
//! all boards at once and collects their replies.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod progress;
pub mod session;
pub mod shell;

mod fanout;

pub use config::ControllerConfig;
pub use dispatcher::{ChannelReply, DispatchReport, Dispatcher};
pub use error::{ControllerError, DispatchError, HandshakeError, Result};
pub use handshake::{Handshake, HandshakeConfig};
pub use progress::{ProgressEvent, ProgressReceiver, Reporter};
pub use session::{ChannelClose, CloseReport, Session, SessionManager, SessionState};
