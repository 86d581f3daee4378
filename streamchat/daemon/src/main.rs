//! StreamChat Daemon - Streaming Chat Server
//!
//! Serves chat sessions to local clients over a Unix socket using
//! newline-delimited JSON frames. Each connection may stream several
//! sessions at once and cancel, inspect or delete them while they stream.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (config from ~/.config/streamchat/streamchat.toml)
//! streamchat-daemon
//!
//! # Custom socket path and config file
//! streamchat-daemon --socket-path /tmp/streamchat.sock --config ./streamchat.toml
//!
//! # Offline, with the echo model only
//! streamchat-daemon --echo --default-model echo
//!
//! # Verbose logging
//! streamchat-daemon --log-level debug
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use streamchat_core::config::{
    default_config_path, load_config_from_path, ConfigOverrides, HistoryBackend,
};
use streamchat_core::history::{InMemoryHistory, JsonlHistoryStore};
use streamchat_core::{build_router, HistoryStore, RateLimiter, SessionManager};

use server::DaemonServer;

/// StreamChat Daemon - streaming chat sessions over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "streamchat-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "STREAMCHAT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model used when a request names none
    #[arg(short = 'm', long, value_name = "MODEL")]
    default_model: Option<String>,

    /// Store history as JSONL files under this directory
    #[arg(long, value_name = "DIR")]
    history_dir: Option<PathBuf>,

    /// Register the offline echo model
    #[arg(long)]
    echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "STREAMCHAT_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.socket_path {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(ref model) = self.default_model {
            overrides = overrides.with_default_model(model.clone());
        }
        if let Some(ref dir) = self.history_dir {
            overrides = overrides
                .with_history_backend(HistoryBackend::Jsonl)
                .with_history_dir(dir.clone());
        }
        if self.echo {
            overrides = overrides.with_echo(true);
        }
        overrides
    }
}

/// Get the default socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/streamchat-$UID/
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("streamchat")
            .join("streamchat.sock")
    } else {
        // SAFETY: getuid has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/streamchat-{uid}/streamchat.sock"))
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "streamchat_daemon={level},streamchat_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Open the configured history store
async fn open_history(
    backend: HistoryBackend,
    dir: &std::path::Path,
) -> Result<Arc<dyn HistoryStore>> {
    Ok(match backend {
        HistoryBackend::Memory => Arc::new(InMemoryHistory::new()),
        HistoryBackend::Jsonl => Arc::new(
            JsonlHistoryStore::open(dir)
                .await
                .with_context(|| format!("Failed to open history directory: {dir:?}"))?,
        ),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("StreamChat Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    // Layered configuration: defaults, file, environment, CLI
    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    info!(
        source = %config.source(),
        file = ?config.config_file_path,
        "Configuration loaded"
    );

    let socket_path = config.socket_path.clone().unwrap_or_else(default_socket_path);
    info!(socket_path = ?socket_path, "Socket path");

    let history = open_history(config.history.backend, &config.history.dir).await?;
    let router = build_router(&config).context("Failed to build model router")?;
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let manager = Arc::new(SessionManager::new(
        router,
        limiter,
        history,
        config.session.clone(),
    ));
    let janitor = manager.spawn_janitor();

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        let _ = shutdown_tx.send(true);
    });

    // Create and run daemon server
    let mut server = DaemonServer::new(socket_path.clone(), Arc::clone(&manager));
    let result = server.run(shutdown_rx).await;

    // Cleanup
    info!("Shutting down...");
    janitor.abort();

    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    match result {
        Ok(()) => {
            info!("StreamChat daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
