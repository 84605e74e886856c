#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use relayterm_protocol::{ConnectParams, ControlMessage, Frame, FrameCodec, Framing, WireMessage};
use relayterm_server::config::{FileConfig, ServerConfig, TerminalFileConfig};
use relayterm_server::{AppState, router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const STEP: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

/// Serve a `shell` kind running `/bin/sh` on an ephemeral port.
pub async fn start_server() -> TestServer {
    let mut fc = FileConfig::default();
    fc.terminals.insert(
        "shell".to_string(),
        TerminalFileConfig {
            command: Some("/bin/sh".to_string()),
            ..Default::default()
        },
    );
    let config = ServerConfig::from_file(&fc).unwrap();
    let state = AppState::new(&config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state }
}

#[derive(Debug)]
pub enum Event {
    Frame(Frame),
    Closed { code: Option<u16>, reason: String },
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: FrameCodec,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, params: ConnectParams) -> Self {
        let codec = FrameCodec::new(params.framing.unwrap_or(Framing::Tagged));
        let url = format!("ws://{}/terminal/shell?{}", addr, params.to_query());
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { ws, codec }
    }

    pub async fn fresh(addr: SocketAddr) -> Self {
        Self::connect(addr, ConnectParams::default()).await
    }

    pub async fn resume(addr: SocketAddr, session_id: &str) -> Self {
        Self::connect(
            addr,
            ConnectParams {
                session_id: Some(session_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn next_event(&mut self) -> Event {
        loop {
            let msg = timeout(STEP, self.ws.next())
                .await
                .expect("timed out waiting for a message");
            let wire = match msg {
                Some(Ok(Message::Text(text))) => WireMessage::Text(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => WireMessage::Binary(bytes.to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    return Event::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => {
                    return Event::Closed {
                        code: None,
                        reason: String::new(),
                    };
                }
            };
            return Event::Frame(self.codec.decode(wire).expect("server sent a bad frame"));
        }
    }

    /// The first frame must be the session announcement.
    pub async fn expect_session(&mut self) -> (String, bool) {
        match self.next_event().await {
            Event::Frame(Frame::Control(ControlMessage::Session {
                session_id,
                reconnected,
            })) => (session_id, reconnected),
            other => panic!("expected session frame, got {:?}", other),
        }
    }

    /// Skip output until the connection closes; return the close code.
    pub async fn expect_close(&mut self) -> (Option<u16>, Vec<Frame>) {
        let mut seen = Vec::new();
        loop {
            match self.next_event().await {
                Event::Frame(frame) => seen.push(frame),
                Event::Closed { code, .. } => return (code, seen),
            }
        }
    }

    /// Collect output until `needle` shows up.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let mut out = String::new();
        while !out.contains(needle) {
            match self.next_event().await {
                Event::Frame(Frame::Data(bytes)) => out.push_str(&String::from_utf8_lossy(&bytes)),
                Event::Frame(_) => {}
                Event::Closed { code, .. } => {
                    panic!("closed ({:?}) before {:?} appeared in {:?}", code, needle, out)
                }
            }
        }
        out
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        let msg = match self.codec.encode(&frame).unwrap() {
            WireMessage::Text(text) => Message::text(text),
            WireMessage::Binary(bytes) => Message::binary(bytes),
        };
        self.ws.send(msg).await.unwrap();
    }

    pub async fn send_input(&mut self, text: &str) {
        self.send_frame(Frame::Data(text.as_bytes().to_vec())).await;
    }

    pub async fn send_raw(&mut self, msg: Message) {
        self.ws.send(msg).await.unwrap();
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) {
        self.send_frame(Frame::Control(ControlMessage::Resize { cols, rows }))
            .await;
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
