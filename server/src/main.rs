#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # clusterdialer
//!
//! Reverse tunnel for Kubernetes clusters without an inbound network path.
//!
//! An agent inside each cluster dials out to the dialer and holds a
//! multiplexed WebSocket open; the control plane then reaches in-cluster
//! services through that tunnel.
//!
//! ## Subcommands
//!
//! - `clusterdialer serve` (default) — run the dialer server
//! - `clusterdialer agent` — run the in-cluster agent
//!
//! ## API surface (dialer)
//!
//! | Method | Path                                         | Description                        |
//! |--------|----------------------------------------------|------------------------------------|
//! | ANY    | `/clusteragent/connect`                      | Agent tunnel upgrade + registration|
//! | GET    | `/clusteragent/check`                        | `true`/`false` live session check  |
//! | GET    | `/clusteragent/client-detail/{type}/{key}`   | Detail reported by one client      |
//! | GET    | `/clusteragent/client-detail/{type}`         | All details for a client type      |
//! | GET    | `/clusteragent/sessions`                     | Live sessions                      |
//! | GET    | `/clusteragent/health`                       | Liveness probe                     |
//! | ANY    | `/clusterdialer`                             | Raw tunnel upgrade                 |
//! | GET    | `/clusterdialer/ip`                          | Replica owning a session           |
//! | ANY    | `/*`                                         | Netportal (`X-Portal-*` headers)   |

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use clusterdialer::tunnel::relay::spawn_sweeper;
use clusterdialer::{dialer_router, run_agent, Collaborators, Config, DialerState};

/// Reverse tunnel between firewalled clusters and the control plane.
#[derive(Parser)]
#[command(name = "clusterdialer", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dialer server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the in-cluster agent.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (agent_mode, config_path) = match cli.command {
        Some(Commands::Agent { config }) => (true, config),
        Some(Commands::Serve { config }) => (false, config),
        None => (false, None),
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("clusterdialer: {e}");
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the configured level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = if agent_mode {
        run_agent_mode(config, cancel).await
    } else {
        run_server(config, cancel).await
    };
    match result {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_agent_mode(
    config: Config,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("clusterdialer agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(cluster_key = %config.agent.cluster_key, "dialing {}", config.agent.server_url);
    run_agent(&config.agent, cancel).await?;
    Ok(())
}

async fn run_server(config: Config, cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    info!("clusterdialer v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.skip_auth {
        warn!("tunnel authorization is disabled (auth.skip_auth)");
    }

    let collaborators = Collaborators::from_config(&config).await?;
    let heartbeat_timeout = std::time::Duration::from_secs(config.server.heartbeat_timeout_secs);
    let state = DialerState::new(config, collaborators)?;

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    let sweep_task = spawn_sweeper(state.sessions.clone(), heartbeat_timeout);
    let app = dialer_router(state.clone());

    // Close tunnels on shutdown so upgraded sockets don't hold the server open
    let sessions = state.sessions.clone();
    let drain_cancel = cancel.clone();
    tokio::spawn(async move {
        drain_cancel.cancelled().await;
        sessions.drain_all().await;
    });

    info!("Server ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("Shutting down...");
    sweep_task.abort();
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
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
                warn!("failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
    cancel.cancel();
}
