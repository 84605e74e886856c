/// Errors that can occur during PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// The PTY could not be opened or the command could not be started
    /// (missing binary, exhausted process or descriptor limits).
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    /// Failed to write to PTY
    #[error("failed to write to PTY: {0}")]
    Write(String),
    /// Failed to resize PTY
    #[error("failed to resize PTY: {0}")]
    Resize(String),
    /// Failed to kill PTY process
    #[error("failed to kill PTY process: {0}")]
    Kill(String),
    /// PTY process has exited and its actor is gone
    #[error("PTY process has exited")]
    ProcessExited,
}

impl PtyError {
    pub(crate) fn spawn(command: &str, reason: impl std::fmt::Display) -> Self {
        PtyError::Spawn {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}
