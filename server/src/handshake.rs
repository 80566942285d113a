//! Registration handshake: once a cluster's session is live, tell the
//! cluster registry how to reach it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cluster_registry::{ClusterRegistry, ManageConfig, MANAGE_PROXY};
use crate::tunnel::protocol::ClusterInfo;
use crate::tunnel::session::SessionRegistry;

/// How a handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Manage-config written.
    Patched,
    /// Stored manage-config already matches.
    Unchanged,
    /// Cluster is managed some other way; left alone.
    NotProxy,
    /// No session appeared in time.
    TimedOut,
    /// Registry lookup or patch failed.
    Failed,
}

#[derive(Clone)]
pub struct RegistrationHandshake {
    sessions: SessionRegistry,
    registry: Arc<dyn ClusterRegistry>,
    timeout: Duration,
    check_interval: Duration,
}

impl RegistrationHandshake {
    pub fn new(
        sessions: SessionRegistry,
        registry: Arc<dyn ClusterRegistry>,
        timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            registry,
            timeout,
            check_interval,
        }
    }

    /// Run in the background; the caller's request is not held up.
    pub fn spawn(&self, cluster_key: String, info: ClusterInfo) -> tokio::task::JoinHandle<HandshakeOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.run(&cluster_key, &info).await })
    }

    /// Wait (bounded) for the session, then patch the registry if needed.
    pub async fn run(&self, cluster_key: &str, info: &ClusterInfo) -> HandshakeOutcome {
        match tokio::time::timeout(self.timeout, self.register(cluster_key, info)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(cluster_key, "register cluster info timeout");
                HandshakeOutcome::TimedOut
            }
        }
    }

    async fn register(&self, cluster_key: &str, info: &ClusterInfo) -> HandshakeOutcome {
        while !self.sessions.has_session(cluster_key).await {
            debug!(cluster_key, "session not found, try again");
            tokio::time::sleep(self.check_interval).await;
        }

        info!(cluster_key, "session exists, patching cluster info");
        let cluster = match self.registry.get_cluster(cluster_key).await {
            Ok(c) => c,
            Err(e) => {
                error!(cluster_key, "failed to get cluster from registry: {e}");
                return HandshakeOutcome::Failed;
            }
        };

        if let Some(current) = &cluster.manage_config {
            if current.kind != MANAGE_PROXY {
                warn!(cluster_key, kind = %current.kind, "cluster is not proxy type");
                return HandshakeOutcome::NotProxy;
            }
            if current.token == info.token
                && current.address == info.address
                && current.ca_data == info.ca_cert
            {
                info!(cluster_key, "cluster info unchanged");
                return HandshakeOutcome::Unchanged;
            }
        }

        let patch = ManageConfig {
            kind: MANAGE_PROXY.to_string(),
            address: info.address.clone(),
            ca_data: info.ca_cert.clone(),
            token: info.token.clone(),
            credential_source: MANAGE_PROXY.to_string(),
        };
        match self.registry.patch_manage_config(cluster_key, patch).await {
            Ok(()) => {
                info!(cluster_key, "patched cluster info");
                HandshakeOutcome::Patched
            }
            Err(e) => {
                error!(cluster_key, "failed to patch cluster: {e}");
                HandshakeOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_registry::{Cluster, MemoryClusterRegistry};
    use crate::tunnel::mux::Mux;
    use tokio::sync::mpsc;

    fn info() -> ClusterInfo {
        ClusterInfo {
            address: "https://kubernetes.default.svc:443".into(),
            token: "tok".into(),
            ca_cert: "Y2E=".into(),
        }
    }

    async fn setup(manage_config: Option<ManageConfig>) -> (SessionRegistry, Arc<MemoryClusterRegistry>, RegistrationHandshake) {
        let sessions = SessionRegistry::new(Duration::from_secs(1));
        let registry = Arc::new(MemoryClusterRegistry::default());
        registry
            .insert(Cluster {
                name: "c1".into(),
                manage_config,
            })
            .await;
        let handshake = RegistrationHandshake::new(
            sessions.clone(),
            registry.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        (sessions, registry, handshake)
    }

    async fn connect(sessions: &SessionRegistry, key: &str) {
        let (tx, _rx) = mpsc::channel(8);
        sessions.register(key, Mux::new(tx, false)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_with_same_info_is_a_no_op() {
        let (sessions, registry, handshake) = setup(None).await;
        connect(&sessions, "c1").await;

        assert_eq!(handshake.run("c1", &info()).await, HandshakeOutcome::Patched);
        assert_eq!(handshake.run("c1", &info()).await, HandshakeOutcome::Unchanged);
        assert_eq!(registry.patch_count(), 1);
        let stored = registry.manage_config("c1").await.unwrap();
        assert_eq!(stored.kind, MANAGE_PROXY);
        assert_eq!(stored.ca_data, "Y2E=");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_session_to_appear() {
        let (sessions, registry, handshake) = setup(None).await;
        let task = handshake.spawn("c1".into(), info());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        connect(&sessions, "c1").await;
        assert_eq!(task.await.unwrap(), HandshakeOutcome::Patched);
        assert_eq!(registry.patch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_without_session() {
        let (_sessions, registry, handshake) = setup(None).await;
        assert_eq!(handshake.run("c1", &info()).await, HandshakeOutcome::TimedOut);
        assert_eq!(registry.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leaves_non_proxy_clusters_alone() {
        let (sessions, registry, handshake) = setup(Some(ManageConfig {
            kind: "token".into(),
            ..ManageConfig::default()
        }))
        .await;
        connect(&sessions, "c1").await;
        assert_eq!(handshake.run("c1", &info()).await, HandshakeOutcome::NotProxy);
        assert_eq!(registry.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_info_is_patched_again() {
        let (sessions, registry, handshake) = setup(None).await;
        connect(&sessions, "c1").await;
        handshake.run("c1", &info()).await;
        let rotated = ClusterInfo {
            token: "tok-2".into(),
            ..info()
        };
        assert_eq!(handshake.run("c1", &rotated).await, HandshakeOutcome::Patched);
        assert_eq!(registry.patch_count(), 2);
    }
}
