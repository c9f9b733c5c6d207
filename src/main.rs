//! Scene Relay Server
//!
//! Realtime relay between a control client (viewer/UI) and the rendering
//! tool's execution agent. Forwards commands from control to execution and
//! streams rendered frames from a shared directory back to control.

mod broadcast;
mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::RelayConfig;
use server::RelayServer;

/// Scene Relay Server
///
/// WebSocket relay and frame broadcaster for remote rendering
#[derive(Parser, Debug)]
#[command(name = "scene-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Directory the execution agent writes frames into
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// Broadcast rate in frames per second
    #[arg(long)]
    frame_rate: Option<u32>,

    /// Upper bound on a single relay or frame send, in milliseconds
    #[arg(long)]
    forward_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file (if any) and apply command line overrides
    fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(frames_dir) = self.frames_dir {
            config.frames_dir = frames_dir;
        }
        if let Some(frame_rate) = self.frame_rate {
            config.frame_rate = frame_rate;
        }
        if let Some(timeout) = self.forward_timeout_ms {
            config.forward_timeout_ms = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Scene Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;

    // Create and start the relay server
    let server = Arc::new(RelayServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
