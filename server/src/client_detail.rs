//! Last-known metadata reported by non-cluster clients, keyed by
//! `(client type, session key)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::state::DialerState;
use crate::tunnel::protocol::ClientType;

/// Free-form detail object sent in `X-Erda-Cluster-Detail`.
pub type ClientDetail = Map<String, Value>;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("event webhook returned {0}")]
    Status(u16),
}

/// A client registered (or re-registered) its detail.
#[derive(Debug, Clone)]
pub struct ClientRegistered {
    pub client_type: String,
    pub cluster_key: String,
    pub detail: ClientDetail,
}

impl ClientRegistered {
    fn to_json(&self) -> Value {
        json!({
            "event": "client_registered",
            "clientType": self.client_type,
            "clusterKey": self.cluster_key,
            "detail": self.detail,
        })
    }
}

/// Receiver of "client registered" events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ClientRegistered) -> Result<(), EventError>;
}

/// Logs events; the default when no webhook is configured.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: ClientRegistered) -> Result<(), EventError> {
        info!(
            client_type = %event.client_type,
            cluster_key = %event.cluster_key,
            "client registered"
        );
        Ok(())
    }
}

/// POSTs events as JSON to `[events] url`.
pub struct HttpEventSink {
    client: reqwest::Client,
    url: String,
}

impl HttpEventSink {
    pub fn new(url: &str) -> Result<Self, EventError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn publish(&self, event: ClientRegistered) -> Result<(), EventError> {
        let resp = self.client.post(&self.url).json(&event.to_json()).send().await?;
        if !resp.status().is_success() {
            return Err(EventError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// In-memory detail store guarded by one lock over the whole map-of-maps.
/// Reads hand out clones, never references into the map.
#[derive(Clone)]
pub struct ClientDetailRegistry {
    details: Arc<Mutex<HashMap<String, HashMap<String, ClientDetail>>>>,
    events: Arc<dyn EventSink>,
}

impl ClientDetailRegistry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            details: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Store `detail` and publish an event in the background.
    pub fn upsert(&self, client_type: &str, cluster_key: &str, detail: ClientDetail) {
        {
            let mut details = self.details.lock().unwrap_or_else(PoisonError::into_inner);
            details
                .entry(client_type.to_string())
                .or_default()
                .insert(cluster_key.to_string(), detail.clone());
        }

        let event = ClientRegistered {
            client_type: client_type.to_string(),
            cluster_key: cluster_key.to_string(),
            detail,
        };
        let sink = Arc::clone(&self.events);
        tokio::spawn(async move {
            if let Err(e) = sink.publish(event).await {
                warn!("failed to publish client registered event: {e}");
            }
        });
    }

    pub fn get(&self, client_type: &str, cluster_key: &str) -> Option<ClientDetail> {
        self.details
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_type)
            .and_then(|m| m.get(cluster_key))
            .cloned()
    }

    pub fn list_by_type(&self, client_type: &str) -> Vec<ClientDetail> {
        self.details
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_type)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// `GET /clusteragent/client-detail/{clientType}/{clusterKey}`.
pub async fn get_client_detail(
    State(state): State<DialerState>,
    Path((client_type, cluster_key)): Path<(String, String)>,
) -> Response {
    let client_type = ClientType::parse(&client_type);
    let session_key = client_type.make_client_key(&cluster_key);
    if !state.sessions.has_session(&session_key).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "cluster not found"})),
        )
            .into_response();
    }
    match state.client_details.get(client_type.as_str(), &session_key) {
        Some(detail) => Json(detail).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "client data not found"})),
        )
            .into_response(),
    }
}

/// `GET /clusteragent/client-detail/{clientType}`.
pub async fn list_client_details(
    State(state): State<DialerState>,
    Path(client_type): Path<String>,
) -> Response {
    let client_type = ClientType::parse(&client_type);
    Json(state.client_details.list_by_type(client_type.as_str())).into_response()
}
