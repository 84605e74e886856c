//! relayterm server: long-lived shell sessions reachable over WebSockets.
//!
//! Each terminal kind gets its own [`SessionRegistry`]. A connection to
//! `/terminal/{kind}` attaches to an existing session when it presents a live
//! `sessionId`, or gets a fresh PTY otherwise. At most one connection drives a
//! session at a time; a second client takes it over.

pub mod config;
pub mod error;
pub mod gateway;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod takeover;

pub use config::{FileConfig, ServerConfig, TerminalKind, load_config};
pub use error::SessionError;
pub use gateway::{AppState, cors_layer, router};
pub use reaper::spawn_reaper;
pub use registry::{Attachment, SessionRegistry};
pub use session::{CloseSignal, ConnectionId, ConnectionRef, ConnectionSink, Session, SessionId};
pub use takeover::{BindDecision, decide};
