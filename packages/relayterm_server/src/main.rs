use anyhow::{Context, Result};
use clap::Parser;
use relayterm_server::config::{self, FileConfig, ServerConfig};
use relayterm_server::{AppState, cors_layer, router, spawn_reaper};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relayterm")]
#[command(about = "Persistent terminal sessions over WebSockets")]
struct Cli {
    /// Config file (defaults to <data dir>/relayterm/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let mut file_config: FileConfig = config::load_config(config_path.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&file_config)?);
        return Ok(());
    }

    // Setup logging
    let default_directive = if cli.debug {
        "relayterm=debug,relayterm_server=debug,pty_manager=debug,tower_http=debug,info"
    } else {
        "relayterm=info,relayterm_server=info,pty_manager=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    if let Some(path) = &config_path {
        info!("Config file: {}", path.display());
    }

    let server_config = ServerConfig::from_file(&file_config)?;
    run_server(server_config).await
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config);

    let cancel = CancellationToken::new();
    let reaper = match config.idle_timeout {
        Some(timeout) => {
            info!(
                "Idle sessions close after {}s (checked every {}s)",
                timeout.as_secs(),
                config.sweep_interval.as_secs()
            );
            Some(spawn_reaper(
                state.registries(),
                config.sweep_interval,
                cancel.clone(),
            ))
        }
        None => {
            info!("Idle session eviction disabled");
            None
        }
    };

    let app = router(state.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
            .layer(cors_layer(&config.cors_origins)?),
    );

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("relayterm listening on http://{}", actual_addr);
    info!("Default framing: {}", config.default_framing);
    for kind in &config.kinds {
        info!(
            "  WS   /terminal/{}  ->  {} {}",
            kind.name,
            kind.command,
            kind.args.join(" ")
        );
    }
    info!("  GET  /health");

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Received shutdown signal, closing sessions...");
        shutdown_state.shutdown().await;
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    cancel.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    // Sessions created while connections were draining.
    state.shutdown().await;

    info!("Shutdown complete");
    server_result
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
