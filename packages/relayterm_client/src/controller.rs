use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relayterm_protocol::{
    ConnectParams, ControlMessage, Frame, FrameCodec, Framing, WireMessage, close_code,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::ClientError;
use crate::store::SessionStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How to reach the server and which session to keep alive.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base WebSocket url, e.g. `ws://127.0.0.1:3001`.
    pub server_url: String,
    /// Terminal kind, the last path segment of `/terminal/{kind}`.
    pub kind: String,
    /// Name under which the session id is stored.
    pub session_key: String,
    /// Identifies this client so its own reconnects are not takeovers.
    pub client_id: String,
    pub framing: Framing,
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    /// A connection that got its session and stayed open this long resets
    /// the backoff. Shorter ones keep counting toward `backoff.max_attempts`.
    pub stable_after: Duration,
    /// Initial terminal size, sent on every (re)connect until resized.
    pub cols: u16,
    pub rows: u16,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            kind: kind.into(),
            session_key: "default".to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            framing: Framing::Tagged,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            stable_after: Duration::from_secs(5),
            cols: 80,
            rows: 24,
        }
    }

    pub fn terminal_url(&self, session_id: Option<&str>) -> String {
        let params = ConnectParams {
            session_id: session_id.map(str::to_string),
            client_id: Some(self.client_id.clone()),
            framing: Some(self.framing),
        };
        format!(
            "{}/terminal/{}?{}",
            self.server_url.trim_end_matches('/'),
            self.kind,
            params.to_query()
        )
    }
}

/// Coarse connection indicator for a UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Open,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Another client took the session. Stays here until `reconnect()`.
    Displaced,
    /// Retries exhausted. Stays here until `reconnect()`.
    GaveUp,
}

impl ClientState {
    pub fn status(self) -> ConnectionStatus {
        match self {
            ClientState::Open => ConnectionStatus::Connected,
            ClientState::Connecting | ClientState::Reconnecting => ConnectionStatus::Reconnecting,
            ClientState::Disconnected | ClientState::Displaced | ClientState::GaveUp => {
                ConnectionStatus::Disconnected
            }
        }
    }
}

/// What the renderer and UI get told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Terminal bytes to render.
    Output(Vec<u8>),
    /// Clear the local screen.
    Clear,
    SessionAssigned {
        session_id: String,
        reconnected: bool,
    },
    /// Another client claimed the session; auto-reconnect stops.
    TakenOver { message: Option<String> },
    /// The session is gone for good; the next connect starts a new one.
    SessionEnded { code: u16, reason: String },
    /// Reconnect attempts exhausted.
    GaveUp { attempts: u32 },
}

enum Command {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Clear,
    Reconnect,
    Shutdown,
}

/// What to do after a connection closes, based on its close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Transport drop: retry the same session after a backoff delay.
    Retry,
    /// Session is gone; forget it and start a new one after a backoff delay.
    NewSession,
    /// Someone else owns the session now.
    Displaced { notify: bool },
}

pub(crate) fn classify_close(code: Option<u16>) -> CloseAction {
    match code {
        Some(close_code::TAKEOVER) => CloseAction::Displaced { notify: true },
        Some(close_code::SUPERSEDED) => CloseAction::Displaced { notify: false },
        Some(code) if close_code::ends_session(code) => CloseAction::NewSession,
        _ => CloseAction::Retry,
    }
}

/// Handle to a background task that keeps one terminal session connected.
///
/// Input is only forwarded while the connection is open. Bytes sent while
/// disconnected or reconnecting are dropped, never queued.
pub struct TerminalClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ClientState>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl TerminalClient {
    /// Start connecting. Events arrive on the returned receiver.
    pub fn spawn(
        config: ClientConfig,
        store: Arc<dyn SessionStore>,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let controller = Controller {
            codec: FrameCodec::new(config.framing),
            dims: (config.cols, config.rows),
            config,
            store,
            session_id: None,
            attached: false,
            end_reported: false,
            events: events_tx,
            commands: commands_rx,
            state: state_tx,
            status: status_tx,
        };
        let task = tokio::spawn(controller.run());

        (
            Self {
                commands: commands_tx,
                state: state_rx,
                status: status_rx,
                task,
            },
            events_rx,
        )
    }

    /// Type a line: `text` followed by a carriage return.
    pub async fn send_command(&self, text: &str) -> bool {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\r');
        self.send_raw(&bytes).await
    }

    /// Send raw input bytes. Returns false if they were dropped because the
    /// connection is not open.
    pub async fn send_raw(&self, bytes: &[u8]) -> bool {
        if !self.is_connected() {
            debug!("Dropping {} input bytes while not connected", bytes.len());
            return false;
        }
        self.commands
            .send(Command::Input(bytes.to_vec()))
            .await
            .is_ok()
    }

    /// Record a new size and send it if connected. Zero dimensions are ignored.
    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            warn!("Ignoring resize to {}x{}", cols, rows);
            return false;
        }
        self.commands
            .send(Command::Resize { cols, rows })
            .await
            .is_ok()
    }

    /// Ask the renderer to clear its screen.
    pub async fn clear(&self) -> bool {
        self.commands.send(Command::Clear).await.is_ok()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ClientState::Open
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Connect again now. Resets the backoff and leaves `Displaced`/`GaveUp`.
    pub async fn reconnect(&self) -> bool {
        self.commands.send(Command::Reconnect).await.is_ok()
    }

    /// Close the connection and stop the background task. The server keeps
    /// the session, so the stored id can be resumed later.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Client task ended abnormally: {}", e);
        }
    }
}

/// Why a connected period ended.
enum Ended {
    Closed(Option<u16>, String),
    /// A takeover notice arrived and was already reported.
    TakenOver,
    Dropped,
    Reconnect,
    Shutdown,
}

/// What the outer loop does next.
enum Next {
    Connect,
    /// Connect with the backoff counter reset.
    Fresh,
    Backoff,
    Wait(ClientState),
    Stop,
}

struct Controller {
    config: ClientConfig,
    store: Arc<dyn SessionStore>,
    codec: FrameCodec,
    session_id: Option<String>,
    /// A `session` frame arrived on the current connection.
    attached: bool,
    /// `SessionEnded` was emitted and no session has been assigned since.
    end_reported: bool,
    dims: (u16, u16),
    events: mpsc::Sender<ClientEvent>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ClientState>,
    status: watch::Sender<ConnectionStatus>,
}

impl Controller {
    async fn run(mut self) {
        self.session_id = match self.store.load(&self.config.session_key) {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not read stored session id: {}", e);
                None
            }
        };

        let mut attempt: u32 = 0;
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Fresh => {
                    attempt = 0;
                    self.connect_once(&mut attempt).await
                }
                Next::Connect => self.connect_once(&mut attempt).await,
                Next::Backoff => {
                    attempt += 1;
                    match self.config.backoff.delay(attempt) {
                        Some(delay) => {
                            self.set_state(ClientState::Reconnecting);
                            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
                            self.idle(Some(delay)).await
                        }
                        None => {
                            info!("Giving up after {} reconnect attempts", attempt - 1);
                            self.emit(ClientEvent::GaveUp {
                                attempts: attempt - 1,
                            })
                            .await;
                            Next::Wait(ClientState::GaveUp)
                        }
                    }
                }
                Next::Wait(state) => {
                    self.set_state(state);
                    self.idle(None).await
                }
                Next::Stop => break,
            };
        }

        self.set_state(ClientState::Disconnected);
        debug!("Client controller stopped");
    }

    async fn connect_once(&mut self, attempt: &mut u32) -> Next {
        self.set_state(ClientState::Connecting);
        let url = self.config.terminal_url(self.session_id.as_deref());
        debug!("Connecting to {}", url);

        let ws = match tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                return self
                    .connect_failed(ClientError::from_tungstenite(e), *attempt)
                    .await;
            }
            Err(_) => return self.connect_failed(ClientError::Timeout, *attempt).await,
        };

        self.attached = false;
        self.set_state(ClientState::Open);
        info!("Connected to {}", self.config.server_url);

        let opened = Instant::now();
        let ended = self.drive(ws).await;
        if self.attached && opened.elapsed() >= self.config.stable_after {
            *attempt = 0;
        }
        match ended {
            Ended::Shutdown => Next::Stop,
            Ended::Reconnect => Next::Fresh,
            Ended::Dropped => Next::Backoff,
            Ended::TakenOver => {
                info!("Session taken over by another connection");
                Next::Wait(ClientState::Displaced)
            }
            Ended::Closed(code, reason) => self.on_close(code, reason).await,
        }
    }

    async fn connect_failed(&mut self, err: ClientError, attempt: u32) -> Next {
        if err.is_permanent() {
            warn!("Not retrying: {}", err);
            self.emit(ClientEvent::GaveUp { attempts: attempt }).await;
            return Next::Wait(ClientState::GaveUp);
        }
        debug!("Connection attempt failed: {}", err);
        Next::Backoff
    }

    async fn on_close(&mut self, code: Option<u16>, reason: String) -> Next {
        match classify_close(code) {
            CloseAction::Retry => {
                debug!("Connection closed ({:?}), will retry", code);
                Next::Backoff
            }
            CloseAction::Displaced { notify } => {
                info!("Session taken over by another connection");
                if notify {
                    self.emit(ClientEvent::TakenOver { message: None }).await;
                }
                Next::Wait(ClientState::Displaced)
            }
            CloseAction::NewSession => {
                let code = code.unwrap_or_default();
                info!("Session ended ({}): {}", code, reason);
                self.session_id = None;
                if let Err(e) = self.store.forget(&self.config.session_key) {
                    warn!("Could not clear stored session id: {}", e);
                }
                if !self.end_reported {
                    self.end_reported = true;
                    self.emit(ClientEvent::SessionEnded { code, reason }).await;
                }
                Next::Backoff
            }
        }
    }

    /// Pump one open connection until it ends.
    async fn drive(&mut self, ws: WsStream) -> Ended {
        let (mut sink, mut stream) = ws.split();

        let (cols, rows) = self.dims;
        if self
            .send(&mut sink, Frame::Control(ControlMessage::Resize { cols, rows }))
            .await
            .is_err()
        {
            return Ended::Dropped;
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ended::Shutdown;
                    }
                    Some(Command::Reconnect) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ended::Reconnect;
                    }
                    Some(Command::Input(bytes)) => {
                        if self.send(&mut sink, Frame::Data(bytes)).await.is_err() {
                            return Ended::Dropped;
                        }
                    }
                    Some(Command::Resize { cols, rows }) => {
                        self.dims = (cols, rows);
                        let resize = Frame::Control(ControlMessage::Resize { cols, rows });
                        if self.send(&mut sink, resize).await.is_err() {
                            return Ended::Dropped;
                        }
                    }
                    Some(Command::Clear) => self.emit(ClientEvent::Clear).await,
                },
                msg = stream.next() => {
                    let wire = match msg {
                        Some(Ok(Message::Text(text))) => WireMessage::Text(text.to_string()),
                        Some(Ok(Message::Binary(bytes))) => WireMessage::Binary(bytes.to_vec()),
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            return Ended::Closed(code, reason);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!("WebSocket error: {}", e);
                            return Ended::Dropped;
                        }
                        None => return Ended::Dropped,
                    };
                    if self.on_frame(wire).await {
                        drain(&mut stream).await;
                        return Ended::TakenOver;
                    }
                }
            }
        }
    }

    /// Handle one inbound message. True when it was a takeover notice.
    async fn on_frame(&mut self, wire: WireMessage) -> bool {
        match self.codec.decode(wire) {
            Ok(Frame::Data(bytes)) => self.emit(ClientEvent::Output(bytes)).await,
            Ok(Frame::Control(ControlMessage::Session {
                session_id,
                reconnected,
            })) => {
                if let Err(e) = self.store.save(&self.config.session_key, &session_id) {
                    warn!("Could not persist session id: {}", e);
                }
                info!(reconnected, "Attached to session {}", session_id);
                self.session_id = Some(session_id.clone());
                self.attached = true;
                self.end_reported = false;
                self.emit(ClientEvent::SessionAssigned {
                    session_id,
                    reconnected,
                })
                .await;
            }
            Ok(Frame::Control(ControlMessage::Takeover { message })) => {
                self.emit(ClientEvent::TakenOver { message }).await;
                return true;
            }
            Ok(Frame::Control(other)) => debug!("Ignoring control message {:?}", other),
            Err(e) => warn!("Dropping undecodable frame: {}", e),
        }
        false
    }

    async fn send(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        frame: Frame,
    ) -> Result<(), ClientError> {
        let message = match self.codec.encode(&frame)? {
            WireMessage::Text(text) => Message::text(text),
            WireMessage::Binary(bytes) => Message::binary(bytes),
        };
        sink.send(message).await.map_err(ClientError::from_tungstenite)
    }

    /// Not connected: handle commands until it is time to connect again.
    /// With a delay, connect when it elapses; without one, wait for `reconnect()`.
    async fn idle(&mut self, delay: Option<Duration>) -> Next {
        let sleep = tokio::time::sleep(delay.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep, if delay.is_some() => return Next::Connect,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return Next::Stop,
                    Some(Command::Reconnect) => return Next::Fresh,
                    Some(Command::Input(bytes)) => {
                        debug!("Dropping {} input bytes typed while disconnected", bytes.len());
                    }
                    Some(Command::Resize { cols, rows }) => self.dims = (cols, rows),
                    Some(Command::Clear) => self.emit(ClientEvent::Clear).await,
                },
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
        self.status.send_if_modified(|current| {
            let next = state.status();
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Read until the server's close frame so the socket shuts down cleanly.
async fn drain(stream: &mut SplitStream<WsStream>) {
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = stream.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}
