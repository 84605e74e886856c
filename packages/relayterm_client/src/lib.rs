//! Client side of relayterm: keeps one remote terminal session attached
//! across network drops, resuming by session id and backing off between
//! attempts.
//!
//! Input typed while the connection is down is dropped, not buffered.

pub mod backoff;
pub mod controller;
pub mod error;
pub mod store;

pub use backoff::Backoff;
pub use controller::{ClientConfig, ClientEvent, ClientState, ConnectionStatus, TerminalClient};
pub use error::ClientError;
pub use store::{JsonFileStore, MemoryStore, SessionStore};
