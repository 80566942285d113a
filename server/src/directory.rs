//! Location directory: which dialer replica owns a cluster's session.
//!
//! Sessions live in one replica's memory, but requests can land on any
//! replica. Each registration records `cluster key → replica IP` in etcd so
//! the owner can be found via `GET /clusterdialer/ip?clusterKey=`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use etcd_client::{Client, ConnectOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EtcdConfig;
use crate::state::DialerState;

/// Key prefix for location entries.
pub const ETCD_KEY_PREFIX: &str = "cluster-manager/clusterKey/";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("malformed location entry: {0}")]
    Decode(String),
    #[error("no etcd endpoints configured")]
    NoEndpoints,
}

/// `cluster key → replica IP` store.
#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn put(&self, cluster_key: &str, ip: &str) -> Result<(), DirectoryError>;
    /// `Ok(None)` when no replica has claimed the key.
    async fn get(&self, cluster_key: &str) -> Result<Option<String>, DirectoryError>;
}

/// etcd v3 client balanced over the configured endpoints.
pub struct EtcdDirectory {
    client: Client,
    prefix: String,
}

impl EtcdDirectory {
    pub async fn connect(config: &EtcdConfig) -> Result<Self, DirectoryError> {
        if config.endpoints.is_empty() {
            return Err(DirectoryError::NoEndpoints);
        }
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        let client = Client::connect(config.endpoints.clone(), Some(options)).await?;
        info!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, cluster_key: &str) -> String {
        location_key(&self.prefix, cluster_key)
    }
}

fn location_key(prefix: &str, cluster_key: &str) -> String {
    format!("{prefix}{cluster_key}")
}

#[async_trait]
impl LocationDirectory for EtcdDirectory {
    async fn put(&self, cluster_key: &str, ip: &str) -> Result<(), DirectoryError> {
        // The client is a cheap handle over a shared channel.
        let mut client = self.client.clone();
        client.put(self.key(cluster_key), ip, None).await?;
        Ok(())
    }

    async fn get(&self, cluster_key: &str) -> Result<Option<String>, DirectoryError> {
        let mut client = self.client.clone();
        let resp = client.get(self.key(cluster_key), None).await?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        kv.value_str()
            .map(|ip| Some(ip.to_string()))
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }
}

/// Process-local directory, used when no etcd is configured.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl LocationDirectory for MemoryDirectory {
    async fn put(&self, cluster_key: &str, ip: &str) -> Result<(), DirectoryError> {
        self.entries
            .write()
            .await
            .insert(cluster_key.to_string(), ip.to_string());
        Ok(())
    }

    async fn get(&self, cluster_key: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self.entries.read().await.get(cluster_key).cloned())
    }
}

/// IP this replica advertises: the configured value, else the first
/// non-loopback IPv4 address of an interface that is up.
pub fn local_ip(configured: Option<&str>) -> Option<String> {
    if let Some(ip) = configured.filter(|s| !s.is_empty()) {
        return Some(ip.to_string());
    }
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("getifaddrs failed: {e}");
            return None;
        }
    };
    for ifaddr in addrs {
        if !ifaddr
            .flags
            .contains(nix::net::if_::InterfaceFlags::IFF_UP)
        {
            continue;
        }
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = IpAddr::V4(sin.ip());
        if !ip.is_loopback() {
            return Some(ip.to_string());
        }
    }
    None
}

#[derive(Deserialize)]
pub struct QueryIpParams {
    #[serde(rename = "clusterKey", default)]
    cluster_key: String,
}

#[derive(Serialize)]
struct QueryIpResponse {
    succeeded: bool,
    ip: String,
    error: String,
}

/// `GET /clusterdialer/ip?clusterKey=`.
pub async fn query_ip(
    State(state): State<DialerState>,
    Query(params): Query<QueryIpParams>,
) -> Response {
    let reply = |status: StatusCode, ip: String, error: String| {
        (
            status,
            Json(QueryIpResponse {
                succeeded: status == StatusCode::OK,
                ip,
                error,
            }),
        )
            .into_response()
    };

    let cluster_key = params.cluster_key;
    debug!(cluster_key, "query ip");
    if cluster_key.is_empty() {
        return reply(
            StatusCode::BAD_REQUEST,
            String::new(),
            "MissingParameter: clusterKey".to_string(),
        );
    }
    match state.directory.get(&cluster_key).await {
        Ok(Some(ip)) => reply(StatusCode::OK, ip, String::new()),
        Ok(None) => reply(
            StatusCode::NOT_FOUND,
            String::new(),
            format!("can not find ip for clusterKey {cluster_key}"),
        ),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            String::new(),
            format!("failed to get ip for clusterKey {cluster_key}: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::CredentialAuthorizer;
    use crate::client_detail::LogEventSink;
    use crate::cluster_registry::MemoryClusterRegistry;
    use crate::config::Config;
    use crate::state::Collaborators;
    use crate::tunnel::relay::dialer_router;

    fn dialer_state(directory: Arc<MemoryDirectory>) -> DialerState {
        let config = Config::default();
        let collaborators = Collaborators {
            authorizer: Arc::new(CredentialAuthorizer::from_config(&config.auth)),
            directory,
            registry: Arc::new(MemoryClusterRegistry::default()),
            events: Arc::new(LogEventSink),
        };
        DialerState::new(config, collaborators).unwrap()
    }

    async fn query(state: &DialerState, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = dialer_router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn query_ip_reports_owner() {
        let directory = Arc::new(MemoryDirectory::default());
        directory.put("c1", "10.0.0.5").await.unwrap();
        let state = dialer_state(directory);

        let (status, body) = query(&state, "/clusterdialer/ip?clusterKey=c1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["succeeded"], true);
        assert_eq!(body["ip"], "10.0.0.5");
        assert_eq!(body["error"], "");
    }

    #[tokio::test]
    async fn query_ip_unknown_key_is_not_found() {
        let state = dialer_state(Arc::new(MemoryDirectory::default()));
        let (status, body) = query(&state, "/clusterdialer/ip?clusterKey=ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["succeeded"], false);
        assert_eq!(body["ip"], "");
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn query_ip_requires_cluster_key() {
        let state = dialer_state(Arc::new(MemoryDirectory::default()));
        for uri in ["/clusterdialer/ip", "/clusterdialer/ip?clusterKey="] {
            let (status, body) = query(&state, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["succeeded"], false);
            assert_eq!(body["error"], "MissingParameter: clusterKey");
        }
    }

    #[tokio::test]
    async fn memory_put_then_get() {
        let dir = MemoryDirectory::default();
        dir.put("c1", "10.0.0.5").await.unwrap();
        assert_eq!(dir.get("c1").await.unwrap().as_deref(), Some("10.0.0.5"));
        assert_eq!(dir.get("missing").await.unwrap(), None);
        dir.put("c1", "10.0.0.6").await.unwrap();
        assert_eq!(dir.get("c1").await.unwrap().as_deref(), Some("10.0.0.6"));
    }

    #[test]
    fn location_keys_are_prefixed() {
        assert_eq!(
            location_key(ETCD_KEY_PREFIX, "c1"),
            "cluster-manager/clusterKey/c1"
        );
    }

    #[tokio::test]
    async fn etcd_requires_endpoints() {
        let err = EtcdDirectory::connect(&EtcdConfig {
            endpoints: Vec::new(),
            key_prefix: ETCD_KEY_PREFIX.into(),
            request_timeout_secs: 1,
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, DirectoryError::NoEndpoints));
    }

    #[tokio::test]
    async fn unreachable_etcd_surfaces_errors() {
        let config = EtcdConfig {
            endpoints: vec!["http://127.0.0.1:1".into()],
            key_prefix: ETCD_KEY_PREFIX.into(),
            request_timeout_secs: 1,
        };
        // The channel may connect lazily; either way nothing is stored.
        if let Ok(dir) = EtcdDirectory::connect(&config).await {
            assert!(dir.put("c1", "10.0.0.5").await.is_err());
            assert!(dir.get("c1").await.is_err());
        }
    }

    #[test]
    fn configured_ip_wins() {
        assert_eq!(local_ip(Some("10.1.2.3")).as_deref(), Some("10.1.2.3"));
    }
}
