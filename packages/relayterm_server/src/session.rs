use chrono::{DateTime, Utc};
use pty_manager::PtyHandle;
use relayterm_protocol::Frame;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque, unguessable session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied id. Anything that is not a UUID is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request to close a connection with a WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: String,
}

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

impl CloseSignal {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }
}

/// The registry's view of one WebSocket connection.
///
/// Cloning is cheap; every clone feeds the same outbound queue. The gateway
/// owns the matching [`ConnectionSink`] and drains it onto the socket.
#[derive(Clone)]
pub struct ConnectionRef {
    id: ConnectionId,
    client_id: Option<String>,
    frames: mpsc::Sender<Frame>,
    close: Arc<watch::Sender<Option<CloseSignal>>>,
}

/// Receiving half of a connection's outbound queue.
pub struct ConnectionSink {
    pub frames: mpsc::Receiver<Frame>,
    pub close: watch::Receiver<Option<CloseSignal>>,
}

impl ConnectionRef {
    pub fn new(client_id: Option<String>, queue: usize) -> (Self, ConnectionSink) {
        let (frames_tx, frames_rx) = mpsc::channel(queue.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        (
            Self {
                id: ConnectionId::new(),
                client_id: client_id.filter(|c| !c.is_empty()),
                frames: frames_tx,
                close: Arc::new(close_tx),
            },
            ConnectionSink {
                frames: frames_rx,
                close: close_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Queue a frame, waiting for room. False once the socket side is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.frames.send(frame).await.is_ok()
    }

    /// Queue a frame only if there is room right now.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.frames.try_send(frame).is_ok()
    }

    /// Ask the gateway to flush what is queued and close the socket.
    /// Only the first close request counts.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let signal = CloseSignal::new(code, reason);
        self.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed() || self.close.borrow().is_some()
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Mutable per-session bookkeeping, guarded by the session's slot lock.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub(crate) last_activity: Instant,
    /// Set once the session has been torn down; later binds must fail.
    pub(crate) closed: bool,
}

/// One PTY process and whichever connection currently drives it.
pub struct Session {
    id: SessionId,
    kind: String,
    pty: PtyHandle,
    created_at: DateTime<Utc>,
    pub(crate) slot: Mutex<SessionSlot>,
    /// Current writer. Only updated while `slot` is held.
    pub(crate) active: watch::Sender<Option<ConnectionRef>>,
}

impl Session {
    pub(crate) fn new(kind: &str, pty: PtyHandle) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            id: SessionId::new(),
            kind: kind.to_string(),
            pty,
            created_at: Utc::now(),
            slot: Mutex::new(SessionSlot {
                last_activity: Instant::now(),
                closed: false,
            }),
            active,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    pub fn active_connection(&self) -> Option<ConnectionId> {
        self.active.borrow().as_ref().map(|c| c.id())
    }

    pub fn is_active(&self, connection: ConnectionId) -> bool {
        self.active_connection() == Some(connection)
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Option<ConnectionRef>> {
        self.active.subscribe()
    }

    /// Time since the last bind, unbind, or input.
    pub async fn idle_for(&self) -> std::time::Duration {
        self.slot.lock().await.last_activity.elapsed()
    }

    pub async fn is_closed(&self) -> bool {
        self.slot.lock().await.closed
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pid", &self.pty.pid())
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayterm_protocol::ControlMessage;

    #[test]
    fn session_id_parse_rejects_garbage() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_string()), Some(id));
        assert_eq!(SessionId::parse("not-a-session"), None);
        assert_eq!(SessionId::parse(""), None);
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let signal = CloseSignal::new(4002, long);
        assert!(signal.reason.len() <= MAX_CLOSE_REASON);
        assert!(signal.reason.chars().all(|c| c == 'é'));
    }

    #[test]
    fn empty_client_id_is_anonymous() {
        let (conn, _sink) = ConnectionRef::new(Some(String::new()), 4);
        assert_eq!(conn.client_id(), None);
    }

    #[tokio::test]
    async fn first_close_wins() {
        let (conn, sink) = ConnectionRef::new(None, 4);
        conn.close(4000, "taken over");
        conn.close(4003, "shutdown");
        assert_eq!(
            sink.close.borrow().clone(),
            Some(CloseSignal::new(4000, "taken over"))
        );
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn try_send_respects_capacity() {
        let (conn, mut sink) = ConnectionRef::new(None, 1);
        assert!(conn.try_send(Frame::Data(b"a".to_vec())));
        assert!(!conn.try_send(Frame::Control(ControlMessage::takeover())));
        assert_eq!(sink.frames.recv().await, Some(Frame::Data(b"a".to_vec())));
    }
}
