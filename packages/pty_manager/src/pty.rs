use portable_pty::{Child, CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// How long a killed process group gets to exit on SIGHUP before SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for the child to be reapable after its output closed.
const EXIT_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }
}

/// State of a PTY process
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events emitted by a PTY, in emission order.
#[derive(Clone, Debug)]
pub enum PtyEvent {
    /// Raw bytes read from the PTY master
    Output(Vec<u8>),
    /// The process is gone. Emitted exactly once, after the last `Output`.
    Exited { exit_code: Option<u32> },
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    /// Sent by the reader thread when the master hits EOF or a read error.
    ReaderClosed,
}

/// Handle to communicate with a PTY actor
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    events: broadcast::Sender<PtyEvent>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write bytes to the PTY's stdin.
    ///
    /// Writing to a process that has already exited is a logged no-op that
    /// reports zero bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(PtyMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await;
        if sent.is_err() {
            warn!(pid = ?self.pid, "Dropping {} bytes written to exited PTY", data.len());
            return Ok(0);
        }
        match rx.await {
            Ok(Err(PtyError::ProcessExited)) | Err(_) => {
                warn!(pid = ?self.pid, "Dropping {} bytes written to exited PTY", data.len());
                Ok(0)
            }
            Ok(result) => result,
        }
    }

    /// Write a string to the PTY
    pub async fn write_str(&self, text: &str) -> Result<usize, PtyError> {
        self.write(text.as_bytes()).await
    }

    /// Resize the PTY. Applying the same size twice is harmless.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                cols,
                rows,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ProcessExited)?;
        rx.await.map_err(|_| PtyError::ProcessExited)?
    }

    /// Get the current state of the PTY
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ProcessExited)?;
        rx.await.map_err(|_| PtyError::ProcessExited)
    }

    /// Terminate the process group and release the PTY descriptors.
    ///
    /// Resolves once the process has been reaped; subscribers see
    /// [`PtyEvent::Exited`]. Killing an already-exited PTY is a no-op.
    pub async fn kill(&self) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PtyMessage::Kill { respond_to: tx })
            .await
            .is_err()
        {
            debug!(pid = ?self.pid, "Kill requested for PTY that already exited");
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Subscribe to output and exit events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PtyEvent> {
        self.events.subscribe()
    }

    /// OS process id of the child, captured at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the actor has stopped (process exited or killed).
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The PTY actor that owns a single child process and its master side
pub struct PtyActor {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    events: broadcast::Sender<PtyEvent>,
    receiver: mpsc::Receiver<PtyMessage>,
    exited: bool,
}

impl PtyActor {
    /// Spawn a new PTY and return a handle plus a receiver subscribed before
    /// the first byte is read, so early output (the shell prompt) is never lost.
    pub fn spawn(
        config: PtyConfig,
    ) -> Result<(PtyHandle, broadcast::Receiver<PtyEvent>), PtyError> {
        let cols = if config.cols == 0 { 80 } else { config.cols };
        let rows = if config.rows == 0 { 24 } else { config.rows };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::spawn(&config.command, format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            debug!("Setting working directory: {}", dir);
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for key in ["PATH", "HOME", "USER", "LANG"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?} ({}x{})",
            config.command, config.args, cols, rows
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::spawn(&config.command, e)
        })?;
        // Only the child keeps the slave open, so EOF on the master means exit.
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::spawn(&config.command, format!("clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::spawn(&config.command, format!("take writer: {}", e)))?;

        let (events, first_rx) = broadcast::channel(1024);
        let (msg_tx, msg_rx) = mpsc::channel(64);

        let actor = Self {
            master: Some(pair.master),
            writer: Some(writer),
            child,
            state: PtyState {
                running: true,
                pid,
                command: config.command.clone(),
                args: config.args.clone(),
                cols,
                rows,
            },
            events: events.clone(),
            receiver: msg_rx,
            exited: false,
        };

        let output_tx = events.clone();
        let reader_tx = msg_tx.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || {
                let mut buffer = vec![0u8; 8192];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            debug!("PTY EOF detected");
                            break;
                        }
                        Ok(n) => {
                            // No receivers just means nobody is attached right now.
                            let _ = output_tx.send(PtyEvent::Output(buffer[..n].to_vec()));
                        }
                        Err(e) => {
                            // EIO is how Linux reports a hung-up slave.
                            debug!("PTY read ended: {}", e);
                            break;
                        }
                    }
                }
                let _ = reader_tx.blocking_send(PtyMessage::ReaderClosed);
            })
            .map_err(|e| PtyError::spawn(&config.command, format!("reader thread: {}", e)))?;

        tokio::spawn(actor.run());

        Ok((
            PtyHandle {
                sender: msg_tx,
                events,
                pid,
            },
            first_rx,
        ))
    }

    async fn run(mut self) {
        debug!(
            "PTY actor started for command: {} with PID: {:?}",
            self.state.command, self.state.pid
        );

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    cols,
                    rows,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(cols, rows));
                }
                PtyMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { respond_to } => {
                    let result = self.handle_kill().await;
                    let _ = respond_to.send(result);
                }
                PtyMessage::ReaderClosed => {
                    let status = match self.wait_for_exit(EXIT_REAP_TIMEOUT).await {
                        Some(status) => Some(status),
                        None => {
                            warn!(pid = ?self.state.pid, "PTY output closed but process still alive, killing");
                            let _ = self.child.kill();
                            self.wait_for_exit(KILL_GRACE).await
                        }
                    };
                    self.finish(status);
                }
            }

            if self.exited {
                break;
            }
        }

        debug!("PTY actor for {} shutting down", self.state.command);
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        let writer = self.writer.as_mut().ok_or(PtyError::ProcessExited)?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::Write(e.to_string()))?;
        writer.flush().map_err(|e| PtyError::Write(e.to_string()))?;
        Ok(data.len())
    }

    fn handle_resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::ProcessExited)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;

        self.state.cols = cols;
        self.state.rows = rows;
        Ok(())
    }

    async fn handle_kill(&mut self) -> Result<(), PtyError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            // The child is a session leader, so its pid is the process group id.
            if let Some(pid) = self.state.pid {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    debug!("killpg({}) failed: {}", pid, e);
                }
            }
        }

        self.writer = None;
        self.master = None;

        let status = match self.wait_for_exit(KILL_GRACE).await {
            Some(status) => Some(status),
            None => {
                self.child
                    .kill()
                    .map_err(|e| PtyError::Kill(e.to_string()))?;
                self.wait_for_exit(KILL_GRACE).await
            }
        };

        self.finish(status);
        Ok(())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to poll PTY child: {}", e);
                    return None;
                }
            }
        }
    }

    fn finish(&mut self, status: Option<ExitStatus>) {
        if self.exited {
            return;
        }
        self.exited = true;
        self.state.running = false;
        self.writer = None;
        self.master = None;

        let exit_code = status.map(|s| s.exit_code());
        info!(
            "PTY process {:?} exited with code {:?}",
            self.state.pid, exit_code
        );
        self.state.pid = None;
        let _ = self.events.send(PtyEvent::Exited { exit_code });
    }
}
