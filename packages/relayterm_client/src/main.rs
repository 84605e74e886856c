use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[cfg(unix)]
mod terminal;

#[derive(Parser)]
#[command(name = "relayterm-attach")]
#[command(about = "Attach this terminal to a persistent relayterm session")]
struct Cli {
    /// Server base url
    #[arg(long, default_value = "ws://127.0.0.1:3001")]
    server: String,

    /// Terminal kind to attach to
    #[arg(long, default_value = "shell")]
    kind: String,

    /// Name the session id is remembered under
    #[arg(long, default_value = "default")]
    key: String,

    /// Forget the remembered session and start a new one
    #[arg(long)]
    new: bool,

    /// Use JSON text control messages instead of tagged binary frames
    #[arg(long)]
    legacy: bool,

    /// Session id file (defaults to <data dir>/relayterm/sessions.json)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Reconnect attempts before giving up, 0 retries forever
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The terminal is in raw mode, so logs only go to stderr on request.
    if let Ok(filter) = std::env::var("RELAYTERM_LOG") {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .init();
    }

    attach::run(cli).await
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    let _ = Cli::parse();
    anyhow::bail!("relayterm-attach needs a unix terminal")
}

#[cfg(unix)]
mod attach {
    use anyhow::Result;
    use relayterm_client::{
        Backoff, ClientConfig, ClientEvent, ClientState, JsonFileStore, MemoryStore,
        SessionStore, TerminalClient,
    };
    use relayterm_protocol::Framing;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tracing::warn;

    use super::Cli;
    use crate::terminal::{TerminalGuard, terminal_size};

    const DETACH_BYTE: u8 = 0x1D; // Ctrl-]

    fn open_store(cli: &Cli) -> Arc<dyn SessionStore> {
        match cli.store.clone().or_else(JsonFileStore::default_path) {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => {
                warn!("No data directory; session ids will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        }
    }

    fn notice(text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "\r\n[relayterm: {}]\r\n", text);
        let _ = stdout.flush();
    }

    pub async fn run(cli: Cli) -> Result<()> {
        let store = open_store(&cli);
        if cli.new {
            store.forget(&cli.key)?;
        }

        let mut config = ClientConfig::new(cli.server.clone(), cli.kind.clone());
        config.session_key = cli.key.clone();
        if cli.legacy {
            config.framing = Framing::Legacy;
        }
        config.backoff = Backoff {
            max_attempts: (cli.max_attempts > 0).then_some(cli.max_attempts),
            ..Backoff::default()
        };
        if let Ok((cols, rows)) = terminal_size() {
            config.cols = cols;
            config.rows = rows;
        }

        let guard = TerminalGuard::new();
        guard.enter_raw_mode();
        if guard.is_tty() {
            notice("connecting, Ctrl-] to detach");
        }

        let (client, mut events) = TerminalClient::spawn(config, store);
        let mut sigwinch =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_shutdown = Arc::new(AtomicBool::new(false));
        spawn_stdin_reader(stdin_tx, stdin_shutdown.clone());

        loop {
            tokio::select! {
                data = stdin_rx.recv() => {
                    let Some(data) = data else { break };
                    let (data, detach) = match data.iter().position(|&b| b == DETACH_BYTE) {
                        Some(pos) => (&data[..pos], true),
                        None => (&data[..], false),
                    };
                    match client.state() {
                        ClientState::Displaced | ClientState::GaveUp if !detach => {
                            notice("reconnecting");
                            client.reconnect().await;
                        }
                        _ if !data.is_empty() => {
                            client.send_raw(data).await;
                        }
                        _ => {}
                    }
                    if detach {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    render(event);
                }
                _ = sigwinch.recv() => {
                    if let Ok((cols, rows)) = terminal_size() {
                        client.resize(cols, rows).await;
                    }
                }
            }
        }

        stdin_shutdown.store(true, Ordering::Relaxed);
        client.shutdown().await;
        drop(guard);
        println!("\r\n[relayterm: detached, session kept on the server]");
        Ok(())
    }

    fn render(event: ClientEvent) {
        match event {
            ClientEvent::Output(bytes) => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(&bytes);
                let _ = stdout.flush();
            }
            ClientEvent::Clear => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(b"\x1b[2J\x1b[H");
                let _ = stdout.flush();
            }
            ClientEvent::SessionAssigned { session_id, reconnected } => {
                if !reconnected {
                    notice(&format!("new session {}", session_id));
                }
            }
            ClientEvent::TakenOver { message } => {
                let message = message.unwrap_or_else(|| "session taken over".to_string());
                notice(&format!("{}; press a key to take it back", message));
            }
            ClientEvent::SessionEnded { reason, .. } => {
                notice(&format!("{}; starting a new session", reason));
            }
            ClientEvent::GaveUp { attempts } => {
                notice(&format!(
                    "gave up after {} attempts; press a key to retry",
                    attempts
                ));
            }
        }
    }

    /// Blocking stdin reader. Polls so it can notice `shutdown` between reads.
    fn spawn_stdin_reader(tx: mpsc::Sender<Vec<u8>>, shutdown: Arc<AtomicBool>) {
        std::thread::spawn(move || {
            use nix::libc;
            use std::io::Read;
            use std::os::fd::AsRawFd;

            let stdin = std::io::stdin();
            let stdin_fd = stdin.as_raw_fd();
            let mut buf = [0u8; 4096];
            while !shutdown.load(Ordering::Relaxed) {
                let mut pfd = libc::pollfd {
                    fd: stdin_fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                let ret = unsafe { libc::poll(&mut pfd, 1, 100) };
                if ret <= 0 {
                    continue;
                }
                let mut handle = stdin.lock();
                match handle.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        drop(handle);
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
