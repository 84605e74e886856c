use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure. Recoverable: the controller reconnects.
    #[error("connection failed: {0}")]
    Connection(#[source] tungstenite::Error),

    /// The server answered the upgrade with an HTTP error status.
    #[error("server rejected the connection with HTTP {0}")]
    Rejected(u16),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("session store error: {0}")]
    Store(#[source] std::io::Error),
}

impl ClientError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) => Self::Rejected(response.status().as_u16()),
            _ => Self::Connection(err),
        }
    }

    /// Retrying cannot help: the request itself is wrong (unknown kind, bad url).
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected(status) => (400..500).contains(status),
            Self::Connection(tungstenite::Error::Url(_)) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(std::io::Error::other(err))
    }
}
