use pty_manager::PtyError;
use relayterm_protocol::close_code;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown, malformed, or already-closed session id.
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("failed to start terminal: {0}")]
    Spawn(#[source] PtyError),

    #[error("terminal error: {0}")]
    Pty(#[from] PtyError),
}

impl SessionError {
    /// Close code reported to a connection that fails with this error.
    pub fn close_code(&self) -> u16 {
        match self {
            SessionError::Spawn(_) => close_code::SPAWN_FAILED,
            SessionError::NotFound(_) => close_code::SESSION_ENDED,
            SessionError::Pty(_) => close_code::SESSION_CLOSED,
        }
    }
}
