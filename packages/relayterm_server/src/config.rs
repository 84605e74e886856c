use anyhow::{Context, Result, bail};
use pty_manager::PtyConfig;
use relayterm_protocol::Framing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [session]
//                    idle_timeout_secs = 600
//
//   env var:         RELAYTERM_SESSION__IDLE_TIMEOUT_SECS=600
//
// Terminal kinds live under `[terminals.<name>]`; `shell` is always defined.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default = "default_terminals")]
    pub terminals: BTreeMap<String, TerminalFileConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            server: ServerFileConfig::default(),
            session: SessionFileConfig::default(),
            terminals: default_terminals(),
        }
    }
}

/// Listener and wire settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Framing used when a client does not ask for one.
    #[serde(default)]
    pub framing: Framing,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Frames buffered per connection before output waits on the socket.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            framing: Framing::default(),
            cors_origins: Vec::new(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Session lifetime knobs (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Detached sessions idle for longer than this are closed. 0 disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Kill detached sessions of a kind when a client connects without a session id.
    #[serde(default)]
    pub reap_orphans_on_fresh_connect: bool,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            reap_orphans_on_fresh_connect: false,
        }
    }
}

/// One terminal kind (lives under `[terminals.<name>]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    /// Program to run. Defaults to `$SHELL`, then `/bin/bash`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

fn default_terminals() -> BTreeMap<String, TerminalFileConfig> {
    BTreeMap::from([("shell".to_string(), TerminalFileConfig::default())])
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_outbound_queue() -> usize {
    256
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    30
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

/// Where the config file is looked up when `--config` is not given.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("relayterm").join("config.toml"))
}

/// Build a figment that layers: defaults → config.toml → RELAYTERM_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAYTERM_SERVER__PORT=8080`  →  `server.port = 8080`
///   `RELAYTERM_TERMINALS__SHELL__COMMAND=/bin/zsh`  →  `terminals.shell.command`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("RELAYTERM_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

/// A resolved terminal kind: what to spawn for `/terminal/{name}`.
#[derive(Clone, Debug)]
pub struct TerminalKind {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl TerminalKind {
    pub fn from_file(name: &str, fc: &TerminalFileConfig) -> Self {
        Self {
            name: name.to_string(),
            command: fc.command.clone().unwrap_or_else(default_shell),
            args: fc.args.clone(),
            working_dir: fc.working_dir.clone(),
            env: fc.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cols: fc.cols,
            rows: fc.rows,
        }
    }

    pub fn pty_config(&self) -> PtyConfig {
        PtyConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Server configuration for runtime behavior.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub default_framing: Framing,
    pub cors_origins: Vec<String>,
    pub outbound_queue: usize,
    /// None disables idle eviction.
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub reap_orphans_on_fresh_connect: bool,
    pub kinds: Vec<TerminalKind>,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        if fc.terminals.is_empty() {
            bail!("at least one terminal kind must be configured");
        }
        if fc.session.sweep_interval_secs == 0 {
            bail!("session.sweep_interval_secs must be greater than zero");
        }

        Ok(Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            default_framing: fc.server.framing,
            cors_origins: fc.server.cors_origins.clone(),
            outbound_queue: fc.server.outbound_queue.max(1),
            idle_timeout: if fc.session.idle_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.session.idle_timeout_secs))
            },
            sweep_interval: Duration::from_secs(fc.session.sweep_interval_secs),
            reap_orphans_on_fresh_connect: fc.session.reap_orphans_on_fresh_connect,
            kinds: fc
                .terminals
                .iter()
                .map(|(name, tc)| TerminalKind::from_file(name, tc))
                .collect(),
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 3001);
        assert_eq!(fc.server.framing, Framing::Tagged);
        assert!(fc.server.cors_origins.is_empty());
        assert_eq!(fc.server.outbound_queue, 256);
        assert_eq!(fc.session.idle_timeout_secs, 3600);
        assert_eq!(fc.session.sweep_interval_secs, 60);
        assert!(!fc.session.reap_orphans_on_fresh_connect);

        let shell = &fc.terminals["shell"];
        assert!(shell.command.is_none());
        assert_eq!((shell.cols, shell.rows), (120, 30));
    }

    // ── ServerConfig::from_file ─────────────────────────────────────────

    #[test]
    fn test_server_config_from_file_defaults() {
        let sc = ServerConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(sc.idle_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(sc.sweep_interval, Duration::from_secs(60));
        assert_eq!(sc.kinds.len(), 1);
        assert_eq!(sc.kinds[0].name, "shell");
        assert!(!sc.kinds[0].command.is_empty());
        assert_eq!(sc.socket_addr().unwrap().port(), 3001);
    }

    #[test]
    fn test_idle_timeout_zero_disables() {
        let mut fc = FileConfig::default();
        fc.session.idle_timeout_secs = 0;
        let sc = ServerConfig::from_file(&fc).unwrap();
        assert!(sc.idle_timeout.is_none());
    }

    #[test]
    fn test_rejects_empty_terminals_and_zero_sweep() {
        let mut fc = FileConfig::default();
        fc.terminals.clear();
        assert!(ServerConfig::from_file(&fc).is_err());

        let mut fc = FileConfig::default();
        fc.session.sweep_interval_secs = 0;
        assert!(ServerConfig::from_file(&fc).is_err());
    }

    #[test]
    fn test_terminal_kind_pty_config() {
        let tc = TerminalFileConfig {
            command: Some("/usr/bin/python3".to_string()),
            args: vec!["-i".to_string()],
            env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
            ..Default::default()
        };
        let pty = TerminalKind::from_file("python", &tc).pty_config();
        assert_eq!(pty.command, "/usr/bin/python3");
        assert_eq!(pty.args, vec!["-i"]);
        assert_eq!(pty.env, vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
        assert_eq!((pty.cols, pty.rows), (120, 30));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("config.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.server.port, 3001);
        assert!(fc.terminals.contains_key("shell"));
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\nframing = \"legacy\"\ncors_origins = [\"http://localhost:5173\"]\n\n\
             [session]\nidle_timeout_secs = 600\n\n\
             [terminals.python]\ncommand = \"/usr/bin/python3\"\ncols = 100\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.framing, Framing::Legacy);
        assert_eq!(fc.server.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(fc.session.idle_timeout_secs, 600);
        assert_eq!(fc.session.sweep_interval_secs, 60);

        // Configured kinds are added next to the default shell.
        assert!(fc.terminals.contains_key("shell"));
        let python = &fc.terminals["python"];
        assert_eq!(python.command.as_deref(), Some("/usr/bin/python3"));
        assert_eq!((python.cols, python.rows), (100, 30));
    }

    #[test]
    fn test_file_config_serializes_to_toml() {
        let text = toml::to_string_pretty(&FileConfig::default()).unwrap();
        assert!(text.contains("[server]"));
        assert!(text.contains("[terminals.shell]"));
    }
}
