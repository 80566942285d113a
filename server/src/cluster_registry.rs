//! Client for the cluster registry that stores how each cluster is reached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ClusterRegistryConfig;

/// Management type for clusters reached through the tunnel.
pub const MANAGE_PROXY: &str = "proxy";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cluster registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cluster registry returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("cluster {0} not found")]
    NotFound(String),
}

/// How a cluster is reached (owned by the registry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub ca_data: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential_source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub manage_config: Option<ManageConfig>,
}

#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn get_cluster(&self, cluster_key: &str) -> Result<Cluster, RegistryError>;
    async fn patch_manage_config(
        &self,
        cluster_key: &str,
        config: ManageConfig,
    ) -> Result<(), RegistryError>;
}

/// Cluster-manager REST API client.
pub struct HttpClusterRegistry {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    err: Option<EnvelopeError>,
}

#[derive(Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    msg: String,
}

impl HttpClusterRegistry {
    pub fn new(config: &ClusterRegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    async fn check<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<Envelope<T>, RegistryError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let envelope: Envelope<T> = resp.json().await?;
        if !envelope.success {
            return Err(RegistryError::Status {
                status: status.as_u16(),
                message: envelope.err.map(|e| e.msg).unwrap_or_default(),
            });
        }
        Ok(envelope)
    }
}

#[async_trait]
impl ClusterRegistry for HttpClusterRegistry {
    async fn get_cluster(&self, cluster_key: &str) -> Result<Cluster, RegistryError> {
        let resp = self
            .client
            .get(format!("{}/api/clusters/{cluster_key}", self.base_url))
            .header("Internal-Client", "cluster-manager")
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(cluster_key.to_string()));
        }
        Self::check::<Cluster>(resp)
            .await?
            .data
            .ok_or_else(|| RegistryError::NotFound(cluster_key.to_string()))
    }

    async fn patch_manage_config(
        &self,
        cluster_key: &str,
        config: ManageConfig,
    ) -> Result<(), RegistryError> {
        let resp = self
            .client
            .patch(format!("{}/api/clusters", self.base_url))
            .header("Internal-Client", "cluster-manager")
            .json(&serde_json::json!({"name": cluster_key, "manageConfig": config}))
            .send()
            .await?;
        Self::check::<serde_json::Value>(resp).await?;
        Ok(())
    }
}

/// In-memory registry that records every patch.
#[derive(Default)]
pub struct MemoryClusterRegistry {
    clusters: Mutex<HashMap<String, Cluster>>,
    patches: AtomicUsize,
}

impl MemoryClusterRegistry {
    pub async fn insert(&self, cluster: Cluster) {
        self.clusters.lock().await.insert(cluster.name.clone(), cluster);
    }

    pub fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub async fn manage_config(&self, cluster_key: &str) -> Option<ManageConfig> {
        self.clusters
            .lock()
            .await
            .get(cluster_key)
            .and_then(|c| c.manage_config.clone())
    }
}

#[async_trait]
impl ClusterRegistry for MemoryClusterRegistry {
    async fn get_cluster(&self, cluster_key: &str) -> Result<Cluster, RegistryError> {
        self.clusters
            .lock()
            .await
            .get(cluster_key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(cluster_key.to_string()))
    }

    async fn patch_manage_config(
        &self,
        cluster_key: &str,
        config: ManageConfig,
    ) -> Result<(), RegistryError> {
        let mut clusters = self.clusters.lock().await;
        let cluster = clusters
            .get_mut(cluster_key)
            .ok_or_else(|| RegistryError::NotFound(cluster_key.to_string()))?;
        cluster.manage_config = Some(config);
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        response::IntoResponse,
        routing::{get, patch},
        Json, Router,
    };
    use serde_json::{json, Value};

    #[test]
    fn manage_config_wire_names() {
        let cfg = ManageConfig {
            kind: MANAGE_PROXY.into(),
            address: "https://k8s:443".into(),
            ca_data: "Y2E=".into(),
            token: "t".into(),
            credential_source: MANAGE_PROXY.into(),
        };
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["type"], "proxy");
        assert_eq!(v["caData"], "Y2E=");
        assert_eq!(v["credentialSource"], "proxy");
    }

    #[tokio::test]
    async fn http_registry_get_and_patch() {
        let patched: std::sync::Arc<Mutex<Vec<Value>>> = Default::default();
        let sink = patched.clone();
        let app = Router::new()
            .route(
                "/api/clusters/{key}",
                get(|Path(key): Path<String>| async move {
                    if key == "prod" {
                        Json(json!({"success": true, "data": {"name": "prod", "manageConfig": {"type": "proxy", "address": "a"}}}))
                            .into_response()
                    } else {
                        axum::http::StatusCode::NOT_FOUND.into_response()
                    }
                }),
            )
            .route(
                "/api/clusters",
                patch(move |Json(body): Json<Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().await.push(body);
                        Json(json!({"success": true, "data": null}))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let registry = HttpClusterRegistry::new(&ClusterRegistryConfig {
            url: format!("http://{addr}/"),
            request_timeout_secs: 5,
        })
        .unwrap();

        let cluster = registry.get_cluster("prod").await.unwrap();
        assert_eq!(cluster.manage_config.unwrap().address, "a");
        assert!(matches!(
            registry.get_cluster("nope").await,
            Err(RegistryError::NotFound(_))
        ));

        registry
            .patch_manage_config("prod", ManageConfig::default())
            .await
            .unwrap();
        let bodies = patched.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["name"], "prod");
    }
}
