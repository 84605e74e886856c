use chrono::Utc;
use pty_manager::{PtyActor, PtyEvent};
use relayterm_protocol::{ControlMessage, Frame, close_code};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TerminalKind;
use crate::error::SessionError;
use crate::session::{ConnectionId, ConnectionRef, Session, SessionId};
use crate::takeover::{self, BindDecision};

type SessionMap = Arc<RwLock<HashMap<SessionId, Arc<Session>>>>;

/// Result of [`SessionRegistry::attach`].
#[derive(Debug)]
pub struct Attachment {
    pub session: Arc<Session>,
    /// True when an existing session was resumed.
    pub reconnected: bool,
    pub decision: BindDecision,
}

/// All live sessions of one terminal kind.
///
/// The registry owns every PTY it spawns. Connections come and go through
/// [`attach`](Self::attach) and [`unbind`](Self::unbind); a PTY only dies when
/// its process exits, when it is evicted, or on [`shutdown`](Self::shutdown).
pub struct SessionRegistry {
    kind: TerminalKind,
    idle_timeout: Option<Duration>,
    reap_orphans_on_fresh_connect: bool,
    sessions: SessionMap,
}

impl SessionRegistry {
    pub fn new(kind: TerminalKind, idle_timeout: Option<Duration>) -> Self {
        Self {
            kind,
            idle_timeout,
            reap_orphans_on_fresh_connect: false,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_orphan_reaping(mut self, enabled: bool) -> Self {
        self.reap_orphans_on_fresh_connect = enabled;
        self
    }

    pub fn kind(&self) -> &TerminalKind {
        &self.kind
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Look up a live session by its client-facing id.
    pub async fn get(&self, raw_id: &str) -> Result<Arc<Session>, SessionError> {
        let id = SessionId::parse(raw_id).ok_or_else(|| SessionError::NotFound(raw_id.to_string()))?;
        self.lookup(id).await
    }

    async fn lookup(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Get-or-create. A missing, malformed, unknown, or dying id quietly
    /// yields a brand-new session; only a spawn failure is an error.
    pub async fn attach(
        &self,
        requested: Option<&str>,
        conn: &ConnectionRef,
    ) -> Result<Attachment, SessionError> {
        match requested.map(str::trim).filter(|id| !id.is_empty()) {
            Some(raw) => match self.get(raw).await {
                Ok(session) => match self.bind_session(&session, conn).await {
                    Ok(decision) => {
                        return Ok(Attachment {
                            session,
                            reconnected: true,
                            decision,
                        });
                    }
                    Err(e) => debug!(kind = %self.kind.name, "{}, allocating a new session", e),
                },
                Err(e) => debug!(kind = %self.kind.name, "{}, allocating a new session", e),
            },
            None if self.reap_orphans_on_fresh_connect => {
                let reaped = self.reap_orphans().await;
                if reaped > 0 {
                    info!(kind = %self.kind.name, "Reaped {} detached sessions on fresh connect", reaped);
                }
            }
            None => {}
        }

        let session = self.create(conn).await?;
        Ok(Attachment {
            session,
            reconnected: false,
            decision: BindDecision::Attach,
        })
    }

    /// Spawn a PTY for a new session with `conn` as its first writer.
    pub async fn create(&self, conn: &ConnectionRef) -> Result<Arc<Session>, SessionError> {
        let (pty, events) =
            PtyActor::spawn(self.kind.pty_config()).map_err(SessionError::Spawn)?;
        let session = Arc::new(Session::new(&self.kind.name, pty));

        {
            let mut slot = session.slot.lock().await;
            announce(&session, conn, false).await;
            session.active.send_replace(Some(conn.clone()));
            slot.last_activity = Instant::now();
        }

        self.sessions
            .write()
            .await
            .insert(session.id(), session.clone());
        tokio::spawn(relay_output(session.clone(), events, self.sessions.clone()));

        info!(
            session = %session.id(),
            kind = %self.kind.name,
            pid = ?session.pid(),
            conn = %conn.id(),
            "Session created"
        );
        Ok(session)
    }

    /// Make `conn` the writer of session `id`, displacing any previous one.
    pub async fn bind(
        &self,
        id: SessionId,
        conn: &ConnectionRef,
    ) -> Result<BindDecision, SessionError> {
        let session = self.lookup(id).await?;
        self.bind_session(&session, conn).await
    }

    async fn bind_session(
        &self,
        session: &Arc<Session>,
        conn: &ConnectionRef,
    ) -> Result<BindDecision, SessionError> {
        let mut slot = session.slot.lock().await;
        if slot.closed {
            return Err(SessionError::NotFound(session.id().to_string()));
        }

        let previous = session.active.borrow().clone();
        let decision = takeover::decide(previous.as_ref(), conn);
        if decision != BindDecision::AlreadyActive {
            // The session frame is queued before the relay can see `conn`.
            announce(session, conn, true).await;
            session.active.send_replace(Some(conn.clone()));
            if let Some(previous) = &previous {
                takeover::displace(previous, decision, &session.id().to_string());
            }
        }
        slot.last_activity = Instant::now();

        info!(
            session = %session.id(),
            conn = %conn.id(),
            ?decision,
            "Connection bound to session"
        );
        Ok(decision)
    }

    /// Detach `connection` if it is still the writer. The PTY keeps running.
    pub async fn unbind(&self, id: SessionId, connection: ConnectionId) -> bool {
        let Ok(session) = self.lookup(id).await else {
            return false;
        };
        let mut slot = session.slot.lock().await;
        if !session.is_active(connection) {
            debug!(session = %id, conn = %connection, "Ignoring unbind from non-active connection");
            return false;
        }
        session.active.send_replace(None);
        slot.last_activity = Instant::now();
        info!(session = %id, conn = %connection, "Connection detached, session kept alive");
        true
    }

    /// Forward input to the PTY if `connection` is the writer.
    /// Returns false when the bytes were dropped.
    pub async fn write_input(
        &self,
        id: SessionId,
        connection: ConnectionId,
        data: &[u8],
    ) -> Result<bool, SessionError> {
        let Some(session) = self.writable(id, connection, true).await? else {
            debug!(session = %id, conn = %connection, "Dropping {} input bytes from inactive connection", data.len());
            return Ok(false);
        };
        session.pty().write(data).await?;
        Ok(true)
    }

    /// Apply a resize from `connection` if it is the writer. Zero dimensions
    /// are ignored.
    pub async fn resize(
        &self,
        id: SessionId,
        connection: ConnectionId,
        cols: u16,
        rows: u16,
    ) -> Result<bool, SessionError> {
        if cols == 0 || rows == 0 {
            warn!(session = %id, "Ignoring resize to {}x{}", cols, rows);
            return Ok(false);
        }
        let Some(session) = self.writable(id, connection, false).await? else {
            debug!(session = %id, conn = %connection, "Dropping resize from inactive connection");
            return Ok(false);
        };
        session.pty().resize(cols, rows).await?;
        debug!(session = %id, "Resized to {}x{}", cols, rows);
        Ok(true)
    }

    async fn writable(
        &self,
        id: SessionId,
        connection: ConnectionId,
        touch: bool,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let session = self.lookup(id).await?;
        let mut slot = session.slot.lock().await;
        if slot.closed || !session.is_active(connection) {
            return Ok(None);
        }
        if touch {
            slot.last_activity = Instant::now();
        }
        drop(slot);
        Ok(Some(session))
    }

    /// Close detached sessions idle for longer than the idle timeout.
    pub async fn sweep(&self) -> usize {
        match self.idle_timeout {
            Some(timeout) => self.evict_detached(timeout, "idle timeout").await,
            None => 0,
        }
    }

    /// Close every detached session regardless of age.
    pub async fn reap_orphans(&self) -> usize {
        self.evict_detached(Duration::ZERO, "orphaned").await
    }

    async fn evict_detached(&self, min_idle: Duration, why: &str) -> usize {
        let mut evicted = Vec::new();
        for session in self.list().await {
            let mut slot = session.slot.lock().await;
            if slot.closed
                || session.active_connection().is_some()
                || slot.last_activity.elapsed() < min_idle
            {
                continue;
            }
            slot.closed = true;
            drop(slot);
            self.sessions.write().await.remove(&session.id());
            evicted.push(session);
        }

        for session in &evicted {
            let age = Utc::now() - session.created_at();
            let idle_secs = session.idle_for().await.as_secs();
            info!(
                session = %session.id(),
                pid = ?session.pid(),
                idle_secs = idle_secs,
                age_secs = age.num_seconds(),
                "Closing session ({})",
                why
            );
            if let Err(e) = session.pty().kill().await {
                warn!(session = %session.id(), "Failed to kill PTY: {}", e);
            }
        }
        evicted.len()
    }

    /// Kill every PTY and close every writer with 4003.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in &sessions {
            let mut slot = session.slot.lock().await;
            slot.closed = true;
            if let Some(conn) = session.active.send_replace(None) {
                conn.close(close_code::SESSION_CLOSED, "server shutting down");
            }
        }

        for session in &sessions {
            if let Err(e) = session.pty().kill().await {
                warn!(session = %session.id(), "Failed to kill PTY during shutdown: {}", e);
            }
        }
        if !sessions.is_empty() {
            info!(kind = %self.kind.name, "Closed {} sessions", sessions.len());
        }
    }
}

/// Queue the `session` control frame, then a short banner for the terminal.
async fn announce(session: &Session, conn: &ConnectionRef, reconnected: bool) {
    let frame = Frame::Control(ControlMessage::Session {
        session_id: session.id().to_string(),
        reconnected,
    });
    if !conn.send(frame).await {
        debug!(conn = %conn.id(), "Connection gone before session frame was queued");
        return;
    }
    conn.send(Frame::Data(attach_banner(session, reconnected).into_bytes()))
        .await;
}

fn attach_banner(session: &Session, reconnected: bool) -> String {
    if reconnected {
        format!(
            "\r\n\x1b[33mReconnected to existing {} session\x1b[0m\r\n",
            session.kind()
        )
    } else {
        let id = session.id().to_string();
        format!(
            "\r\n\x1b[32mStarting {} session (ID: {})\x1b[0m\r\n",
            session.kind(),
            &id[..8]
        )
    }
}

/// Forward PTY output to whichever connection is the writer at the time.
async fn relay_output(
    session: Arc<Session>,
    mut events: broadcast::Receiver<PtyEvent>,
    sessions: SessionMap,
) {
    let mut active_rx = session.subscribe_active();
    loop {
        match events.recv().await {
            Ok(PtyEvent::Output(bytes)) => {
                let Some(sink) = active_rx.borrow_and_update().clone() else {
                    // Detached: nobody to deliver to.
                    continue;
                };
                tokio::select! {
                    sent = sink.send(Frame::Data(bytes)) => {
                        if !sent {
                            debug!(session = %session.id(), "Writer went away, dropping output");
                        }
                    }
                    _ = active_rx.changed() => {
                        debug!(session = %session.id(), "Writer changed mid-send, dropping output chunk");
                    }
                }
            }
            Ok(PtyEvent::Exited { exit_code }) => {
                end_session(&session, exit_code, &sessions).await;
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(session = %session.id(), "Output relay lagged, {} chunks dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(session = %session.id(), "Output relay stopped");
}

async fn end_session(session: &Session, exit_code: Option<u32>, sessions: &SessionMap) {
    let mut slot = session.slot.lock().await;
    if slot.closed {
        return;
    }
    slot.closed = true;
    sessions.write().await.remove(&session.id());
    let active = session.active.send_replace(None);
    drop(slot);

    let code = exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(session = %session.id(), "Shell exited with code {}, session ended", code);

    if let Some(conn) = active {
        let banner = format!("\r\n[session ended (exit code {})]\r\n", code);
        if !conn.try_send(Frame::Data(banner.into_bytes())) {
            debug!(conn = %conn.id(), "Exit banner not queued, outbound queue full");
        }
        conn.close(
            close_code::SESSION_ENDED,
            format!("session ended (exit code {})", code),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CloseSignal, ConnectionSink};
    use tokio::time::timeout;

    fn sh_kind() -> TerminalKind {
        TerminalKind {
            name: "shell".to_string(),
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(sh_kind(), Some(Duration::from_secs(3600)))
    }

    fn conn(client: Option<&str>) -> (ConnectionRef, ConnectionSink) {
        ConnectionRef::new(client.map(str::to_string), 64)
    }

    async fn next_frame(sink: &mut ConnectionSink) -> Frame {
        timeout(Duration::from_secs(10), sink.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    async fn wait_close(sink: &mut ConnectionSink) -> CloseSignal {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Some(signal) = sink.close.borrow_and_update().clone() {
                    return signal;
                }
                sink.close.changed().await.expect("close channel dropped");
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    fn closed_with(sink: &ConnectionSink) -> Option<u16> {
        sink.close.borrow().as_ref().map(|c| c.code)
    }

    /// Read data frames until `needle` appears.
    async fn read_until(sink: &mut ConnectionSink, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            if let Frame::Data(bytes) = next_frame(sink).await {
                seen.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        seen
    }

    #[tokio::test]
    async fn session_frame_precedes_output() {
        let registry = registry();
        let (a, mut sink) = conn(None);
        let attachment = registry.attach(None, &a).await.unwrap();
        assert!(!attachment.reconnected);

        match next_frame(&mut sink).await {
            Frame::Control(ControlMessage::Session {
                session_id,
                reconnected,
            }) => {
                assert_eq!(session_id, attachment.session.id().to_string());
                assert!(!reconnected);
            }
            other => panic!("expected session frame first, got {:?}", other),
        }
        let short_id = &attachment.session.id().to_string()[..8];
        match next_frame(&mut sink).await {
            Frame::Data(bytes) => {
                let banner = String::from_utf8_lossy(&bytes).to_string();
                assert!(banner.contains("Starting shell session"), "{banner:?}");
                assert!(banner.contains(short_id), "{banner:?}");
            }
            other => panic!("expected start banner, got {:?}", other),
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_or_garbage_id_gets_fresh_session() {
        let registry = registry();
        let (a, _sink_a) = conn(None);
        let first = registry
            .attach(Some(&SessionId::new().to_string()), &a)
            .await
            .unwrap();
        assert!(!first.reconnected);

        let (b, _sink_b) = conn(None);
        let second = registry.attach(Some("{not-a-uuid}"), &b).await.unwrap();
        assert!(!second.reconnected);
        assert_ne!(first.session.id(), second.session.id());
        assert_eq!(registry.len().await, 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn reattach_resumes_same_pty() {
        let registry = registry();
        let (a, _sink_a) = conn(None);
        let first = registry.attach(None, &a).await.unwrap();
        let id = first.session.id();
        assert!(registry.unbind(id, a.id()).await);

        let (b, mut sink_b) = conn(None);
        let second = registry.attach(Some(&id.to_string()), &b).await.unwrap();
        assert!(second.reconnected);
        assert_eq!(second.decision, BindDecision::Attach);
        assert_eq!(second.session.pid(), first.session.pid());
        assert!(matches!(
            next_frame(&mut sink_b).await,
            Frame::Control(ControlMessage::Session {
                reconnected: true,
                ..
            })
        ));
        match next_frame(&mut sink_b).await {
            Frame::Data(bytes) => assert!(
                String::from_utf8_lossy(&bytes).contains("Reconnected to existing shell session")
            ),
            other => panic!("expected reconnect banner, got {:?}", other),
        }
        assert!(second.session.idle_for().await < Duration::from_secs(5));
        assert!(second.session.created_at() <= Utc::now());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_binds_leave_one_writer() {
        let registry = registry();
        let (owner, mut owner_sink) = conn(None);
        let session = registry.attach(None, &owner).await.unwrap().session;

        let (x, x_sink) = conn(Some("x"));
        let (y, y_sink) = conn(Some("y"));
        let (rx, ry) = tokio::join!(
            registry.bind(session.id(), &x),
            registry.bind(session.id(), &y)
        );
        assert_eq!(rx.unwrap(), BindDecision::Takeover);
        assert_eq!(ry.unwrap(), BindDecision::Takeover);

        let x_active = session.is_active(x.id());
        let y_active = session.is_active(y.id());
        assert!(x_active ^ y_active, "exactly one writer must survive");
        let loser = if x_active { &y_sink } else { &x_sink };
        assert_eq!(closed_with(loser), Some(close_code::TAKEOVER));
        assert_eq!(wait_close(&mut owner_sink).await.code, close_code::TAKEOVER);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn takeover_moves_output_to_new_writer() {
        let registry = registry();
        let (x, mut x_sink) = conn(None);
        let session = registry.attach(None, &x).await.unwrap().session;

        let (y, mut y_sink) = conn(None);
        let attachment = registry
            .attach(Some(&session.id().to_string()), &y)
            .await
            .unwrap();
        assert_eq!(attachment.decision, BindDecision::Takeover);

        // X sees the notice and a 4000 close.
        let mut saw_notice = false;
        while let Ok(frame) = x_sink.frames.try_recv() {
            if matches!(frame, Frame::Control(ControlMessage::Takeover { .. })) {
                saw_notice = true;
            }
        }
        assert!(saw_notice);
        assert_eq!(wait_close(&mut x_sink).await.code, close_code::TAKEOVER);

        // Input from X is dropped, input from Y reaches the shell.
        assert!(!registry.write_input(session.id(), x.id(), b"echo from-x\n").await.unwrap());
        assert!(registry.write_input(session.id(), y.id(), b"echo from-$((6 * 7))\n").await.unwrap());
        let out = read_until(&mut y_sink, "from-42").await;
        assert!(out.contains("from-42"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn output_after_takeover_never_reaches_displaced_writer() {
        let registry = registry();
        let (x, mut x_sink) = conn(None);
        let session = registry.attach(None, &x).await.unwrap().session;

        let (y, mut y_sink) = conn(None);
        registry.bind(session.id(), &y).await.unwrap();
        assert!(registry.write_input(session.id(), y.id(), b"echo marker-$((5 * 9))\n").await.unwrap());
        read_until(&mut y_sink, "marker-45").await;

        let mut x_output = String::new();
        while let Ok(frame) = x_sink.frames.try_recv() {
            if let Frame::Data(bytes) = frame {
                x_output.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        assert!(!x_output.contains("marker-45"), "displaced writer got {x_output:?}");
        assert!(!session.is_active(x.id()));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn same_client_rebind_is_a_quiet_reattach() {
        let registry = registry();
        let (old, mut old_sink) = conn(Some("tab-1"));
        let session = registry.attach(None, &old).await.unwrap().session;

        let (new, _new_sink) = conn(Some("tab-1"));
        let decision = registry.bind(session.id(), &new).await.unwrap();
        assert_eq!(decision, BindDecision::Reattach);

        let close = wait_close(&mut old_sink).await;
        assert_eq!(close.code, close_code::SUPERSEDED);
        while let Ok(frame) = old_sink.frames.try_recv() {
            assert!(!matches!(frame, Frame::Control(ControlMessage::Takeover { .. })));
        }
        assert!(session.is_active(new.id()));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn displaced_unbind_does_not_detach_new_writer() {
        let registry = registry();
        let (x, _x_sink) = conn(None);
        let session = registry.attach(None, &x).await.unwrap().session;
        let (y, _y_sink) = conn(None);
        registry.bind(session.id(), &y).await.unwrap();

        assert!(!registry.unbind(session.id(), x.id()).await);
        assert!(session.is_active(y.id()));
        assert!(registry.unbind(session.id(), y.id()).await);
        assert_eq!(session.active_connection(), None);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn resize_is_idempotent_and_ignores_zero() {
        let registry = registry();
        let (a, _sink) = conn(None);
        let session = registry.attach(None, &a).await.unwrap().session;

        assert!(registry.resize(session.id(), a.id(), 120, 40).await.unwrap());
        assert!(registry.resize(session.id(), a.id(), 120, 40).await.unwrap());
        let state = session.pty().state().await.unwrap();
        assert_eq!((state.cols, state.rows), (120, 40));

        assert!(!registry.resize(session.id(), a.id(), 0, 40).await.unwrap());
        let state = session.pty().state().await.unwrap();
        assert_eq!((state.cols, state.rows), (120, 40));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shell_exit_ends_session() {
        let registry = registry();
        let (a, mut sink) = conn(None);
        let session = registry.attach(None, &a).await.unwrap().session;
        let id = session.id();

        registry.write_input(id, a.id(), b"exit 5\n").await.unwrap();
        let close = wait_close(&mut sink).await;
        assert_eq!(close.code, close_code::SESSION_ENDED);
        assert!(close.reason.contains('5'));
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.get(&id.to_string()).await,
            Err(SessionError::NotFound(_))
        ));

        // The old id now yields a new session.
        let (b, _sink_b) = conn(None);
        let next = registry.attach(Some(&id.to_string()), &b).await.unwrap();
        assert!(!next.reconnected);
        assert_ne!(next.session.id(), id);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_evicts_only_detached_idle_sessions() {
        let registry = SessionRegistry::new(sh_kind(), Some(Duration::from_millis(200)));
        let (attached, _sink_a) = conn(None);
        let kept = registry.attach(None, &attached).await.unwrap().session;
        let (leaving, _sink_b) = conn(None);
        let idle = registry.attach(None, &leaving).await.unwrap().session;
        registry.unbind(idle.id(), leaving.id()).await;

        // Not idle long enough yet.
        assert_eq!(registry.sweep().await, 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&kept.id().to_string()).await.is_ok());
        assert!(registry.get(&idle.id().to_string()).await.is_err());
        assert!(idle.is_closed().await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_is_disabled_without_timeout() {
        let registry = SessionRegistry::new(sh_kind(), None);
        let (a, _sink) = conn(None);
        let session = registry.attach(None, &a).await.unwrap().session;
        registry.unbind(session.id(), a.id()).await;
        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.len().await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn fresh_connect_reaps_orphans_when_enabled() {
        let registry = registry().with_orphan_reaping(true);
        let (a, _sink_a) = conn(None);
        let orphan = registry.attach(None, &a).await.unwrap().session;
        registry.unbind(orphan.id(), a.id()).await;

        let (b, _sink_b) = conn(None);
        registry.attach(None, &b).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&orphan.id().to_string()).await.is_err());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_writers_with_4003() {
        let registry = registry();
        let (a, mut sink) = conn(None);
        registry.attach(None, &a).await.unwrap();

        registry.shutdown().await;
        assert_eq!(wait_close(&mut sink).await.code, close_code::SESSION_CLOSED);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let kind = TerminalKind {
            command: "/definitely/not/a/shell".to_string(),
            ..sh_kind()
        };
        let registry = SessionRegistry::new(kind, None);
        let (a, _sink) = conn(None);
        let err = registry.attach(None, &a).await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
        assert_eq!(err.close_code(), close_code::SPAWN_FAILED);
        assert!(registry.is_empty().await);
    }
}
