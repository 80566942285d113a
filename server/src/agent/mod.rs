//! In-cluster agent: holds the reverse tunnel to the dialer.
//!
//! ```text
//! secret.rs        — SecretStore trait + in-memory store
//! credential.rs    — rotating access key and its watcher
//! cluster_info.rs  — service-account token → ClusterInfo
//! leader.rs        — lease-based leader gate
//! k8s.rs           — Kubernetes SecretStore / LeaseLock
//! ```
//!
//! The connector itself lives in [`crate::tunnel::client`].

pub mod cluster_info;
pub mod credential;
pub mod k8s;
pub mod leader;
pub mod secret;

use std::sync::Arc;

use axum::{routing::get, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::k8s::{KubeLeaseLock, KubeSecretStore};
use self::leader::{election_identity, run_with_leader_gate, LeaderElector};
use self::secret::{SecretStore, SecretStoreError};
use crate::config::AgentConfig;
use crate::routes;
use crate::tunnel::client::{AgentConnector, ConnectionControl};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent configuration: {0}")]
    Config(String),
    #[error("kubernetes client: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Secret(#[from] SecretStoreError),
    #[error("cluster info unavailable: {0}")]
    ClusterInfo(String),
    #[error("leadership lost")]
    LeadershipLost,
    #[error("health server: {0}")]
    Health(#[from] std::io::Error),
}

/// Run the agent against the in-cluster Kubernetes API until `cancel` fires.
pub async fn run_agent(config: &AgentConfig, cancel: CancellationToken) -> Result<(), AgentError> {
    let client = kube::Client::try_default().await?;
    let secrets: Arc<dyn SecretStore> = Arc::new(KubeSecretStore::new(client.clone()));
    let connector = Arc::new(AgentConnector::new(config.clone(), secrets));

    let elector = config.leader_election.enabled.then(|| {
        let lock = KubeLeaseLock::new(client, &config.erda_namespace, &config.leader_election.id);
        let identity = election_identity();
        info!(identity = %identity, lease = %config.leader_election.id, "leader election enabled");
        Arc::new(LeaderElector::new(Arc::new(lock), identity, &config.leader_election))
    });

    let health = match &config.health_listen {
        Some(addr) => Some(spawn_health_server(addr, connector.control(), cancel.clone()).await?),
        None => None,
    };

    let result = run(connector, elector, cancel).await;
    if let Some(health) = health {
        let _ = health.await;
    }
    result
}

/// Run the connector, behind the leader gate when an elector is given.
pub async fn run(
    connector: Arc<AgentConnector>,
    elector: Option<Arc<LeaderElector>>,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    match elector {
        Some(elector) => {
            run_with_leader_gate(elector, cancel, |work_cancel| async move {
                connector.start(work_cancel).await
            })
            .await
        }
        None => connector.start(cancel).await,
    }
}

/// Serve `GET /healthz` until `cancel` fires.
pub async fn spawn_health_server(
    addr: &str,
    control: ConnectionControl,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, AgentError> {
    let listener = TcpListener::bind(addr).await?;
    info!("agent health endpoint on {}", listener.local_addr()?);
    let app = Router::new()
        .route("/healthz", get(routes::health::healthz))
        .with_state(control);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!("agent health server failed: {e}");
        }
    }))
}
