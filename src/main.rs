#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vmi-gateway
//!
//! Tunnels device channels of virtual machine instances (VSOCK, serial
//! console, VNC) to remote API clients over WebSocket.
//!
//! ## Subcommands
//!
//! - `vmi-gateway serve` (default) — run the HTTP/WS gateway
//!
//! ## API surface
//!
//! | Method | Path                                                    | Auth | Description            |
//! |--------|---------------------------------------------------------|------|------------------------|
//! | GET    | `/api/health`                                           | No   | Liveness probe         |
//! | GET    | `/api/sessions`                                         | Yes* | Active session gauges  |
//! | GET    | `/apis/subresources.kubevirt.io/v1/…/{name}/vsock`      | Yes* | VSOCK tunnel           |
//! | GET    | `/apis/subresources.kubevirt.io/v1/…/{name}/console`    | Yes* | Serial console tunnel  |
//! | GET    | `/apis/subresources.kubevirt.io/v1/…/{name}/vnc`        | Yes* | VNC tunnel             |
//!
//! *Only when `[auth] api_key` is configured.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! store/           — instance locator (cluster API or in-memory)
//! channel.rs       — per-kind channel validation
//! agent.rs         — node dialer (agent control call + stream open)
//! streamer.rs      — locate → validate → count → dial → relay
//! ws.rs            — WebSocket ↔ AsyncRead/AsyncWrite
//! relay.rs         — bidirectional copy
//! metrics.rs       — active session gauges
//! routes/          — HTTP handlers
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use vmi_gateway::agent::AgentDialer;
use vmi_gateway::metrics::ActiveSessions;
use vmi_gateway::streamer::{StreamSettings, Streamer};
use vmi_gateway::{routes, store, AppState, Config};

/// Device channel gateway for virtual machine instances.
#[derive(Parser)]
#[command(name = "vmi-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    if let Err(e) = run_server(config_path.as_deref()).await {
        error!("{e}");
        eprintln!("vmi-gateway: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("vmi-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.api_key.is_none() {
        info!("No API key configured, requests are not authenticated by the gateway");
    }

    let instances = store::from_config(&config.cluster)?;
    let agent_token = config.agent.resolve_token()?;
    let dialer = AgentDialer::from_config(&config.agent, agent_token)?;
    let settings = StreamSettings::from_config(&config.stream, &config.agent);
    let streamer = Streamer::new(
        instances,
        std::sync::Arc::new(dialer),
        ActiveSessions::new(),
        settings,
    );

    let sweep_interval = Duration::from_secs(config.server.sweep_interval_secs.max(1));
    let state = AppState::new(config, streamer);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    // Periodic sweep: drop gauges of instances with no open sessions
    let sessions = state.sessions.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let pruned = sessions.prune();
            if pruned > 0 {
                info!("Pruned {pruned} idle session gauges");
            }
        }
    });

    // Graceful shutdown
    let shutdown_token = state.shutdown.clone();
    let shutdown = async move {
        wait_for_signal().await;
        // Ends open tunnels so the server can drain.
        shutdown_token.cancel();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutting down...");
    sweep_task.abort();
    info!("Goodbye");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
