#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # bastion-relay
//!
//! Bastion relay host. Browsers connect over WebSocket; the relay bridges
//! them to guacd (RDP, VNC, SSH, Telnet, Kubernetes) or straight to an SSH
//! shell, optionally through an SSH jump host, and lets operators watch live
//! sessions read-only.
//!
//! ## API surface
//!
//! | Method | Path                              | Auth  | Description                     |
//! |--------|-----------------------------------|-------|---------------------------------|
//! | GET    | `/api/health`                     | No    | Liveness probe                  |
//! | POST   | `/api/sessions`                   | Yes   | Create a session for an asset   |
//! | GET    | `/api/sessions`                   | Yes   | List sessions                   |
//! | GET    | `/api/sessions/{id}`              | Yes   | One session                     |
//! | DELETE | `/api/sessions/{id}`              | Yes   | Force-disconnect (code 801)     |
//! | GET    | `/api/gateways`                   | Yes   | Gateway status                  |
//! | POST   | `/api/gateways/{id}/reconnect`    | Yes   | Drop tunnels, re-probe          |
//! | GET    | `/api/ws/tunnel/{session_id}`     | Yes*  | Primary relay socket            |
//! | GET    | `/api/ws/monitor/{session_id}`    | Yes*  | Read-only observer socket       |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization` header
//! available during the upgrade handshake).

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use bastion_relay::sessions::{Disconnect, DisconnectCode};
use bastion_relay::{relay, routes, AppState, Config};

/// Bastion relay host: guacd tunnels, live monitoring, SSH jump hosts.
#[derive(Parser)]
#[command(name = "bastion-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
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
        eprintln!("bastion-relay: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("bastion-relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("guacd at {}", config.guacd.address);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set BASTION_API_KEY or update config");
    }

    let gateways = config.gateways.clone();
    let state = AppState::from_config(config);
    for params in gateways {
        state.gateways.register(params).await;
    }

    let app = routes::build_router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen).await?;

    info!("Server ready");

    // Graceful shutdown
    let shutdown_state = state.clone();
    let shutdown = async move {
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
                    warn!("Failed to register SIGTERM: {e}");
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
        // Live sockets would otherwise hold graceful shutdown open.
        let disconnect = Disconnect::new(DisconnectCode::ServerShutdown, "server shutting down");
        for session in shutdown_state.sessions.snapshot().await {
            relay::finish(&shutdown_state, &session.id, Some(disconnect.clone())).await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Cleanup
    info!("Shutting down...");
    state.gateways.shutdown().await;
    info!("Goodbye");
    Ok(())
}
