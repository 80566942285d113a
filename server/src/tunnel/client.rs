//! Agent connector: outbound WS from the cluster to the dialer.
//!
//! Holds one tunnel per process. Dials with the registration headers, serves
//! `tunnel.connect` requests from the dialer, heartbeats, and redials after
//! a fixed pause whenever the connection drops. A rotated access key tears
//! the connection down and redials at once so the new key is presented.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::mux::Mux;
use super::protocol::{
    ClientType, ClusterInfo, HEADER_AUTHORIZATION, HEADER_CLIENT_DETAIL, HEADER_CLIENT_TYPE,
    HEADER_CLUSTER_INFO, HEADER_CLUSTER_KEY,
};
use super::{encode_binary_frame, ControlMessage, Frame};
use crate::agent::cluster_info::collect_cluster_info;
use crate::agent::credential::{watch_credentials, CredentialRef, CredentialSource};
use crate::agent::secret::SecretStore;
use crate::agent::AgentError;
use crate::config::AgentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorState {
    Idle,
    Dialing,
    Connected,
    Stopped,
}

struct ControlInner {
    state: Mutex<ConnectorState>,
    /// Single-slot: repeated requests before the loop wakes collapse into one.
    disconnect: Notify,
    reconnects: AtomicU64,
}

/// Shared view of the connector for the credential watcher and health checks.
#[derive(Clone)]
pub struct ConnectionControl {
    inner: Arc<ControlInner>,
}

impl Default for ConnectionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                state: Mutex::new(ConnectorState::Idle),
                disconnect: Notify::new(),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectorState::Connected
    }

    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: ConnectorState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Ask the connected loop to drop its connection and redial.
    /// No-op unless connected.
    pub fn request_disconnect(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner.disconnect.notify_one();
        true
    }

    /// Consume a pending disconnect request, if any.
    pub(crate) fn take_disconnect_request(&self) -> bool {
        self.inner.disconnect.notified().now_or_never().is_some()
    }

    async fn disconnect_requested(&self) {
        self.inner.disconnect.notified().await;
    }
}

/// Why a connected tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// Rotation asked for a fresh connection; redial without pausing.
    Requested,
    /// Dialer closed the socket or the network dropped it.
    Closed,
    Cancelled,
}

#[derive(Debug, Error)]
enum ConnectError {
    #[error(transparent)]
    Ws(#[from] tungstenite::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("client detail is not serializable: {0}")]
    Detail(#[from] serde_json::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub struct AgentConnector {
    config: AgentConfig,
    secrets: Arc<dyn SecretStore>,
    credentials: CredentialSource,
    control: ConnectionControl,
}

impl AgentConnector {
    /// A configured static access key pins the credentials; otherwise they
    /// come from the watched secret once [`start`](Self::start) runs.
    pub fn new(config: AgentConfig, secrets: Arc<dyn SecretStore>) -> Self {
        let credentials = match &config.access_key {
            Some(key) if !key.is_empty() => CredentialSource::fixed(key.clone()),
            _ => CredentialSource::new(),
        };
        Self {
            config,
            secrets,
            credentials,
            control: ConnectionControl::new(),
        }
    }

    pub fn control(&self) -> ConnectionControl {
        self.control.clone()
    }

    pub fn credentials(&self) -> CredentialSource {
        self.credentials.clone()
    }

    fn watches_credentials(&self) -> bool {
        self.config.access_key.as_deref().is_none_or(str::is_empty)
    }

    /// Hold a tunnel open until `cancel` fires. Only configuration and
    /// cluster-info collection failures are returned; connection failures
    /// are retried forever.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        if self.config.server_url.is_empty() {
            return Err(AgentError::Config("agent.server_url is not set".into()));
        }
        if self.config.cluster_key.is_empty() {
            return Err(AgentError::Config("agent.cluster_key is not set".into()));
        }

        let cluster_info = if self.config.collect_cluster_info {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.control.set_state(ConnectorState::Stopped);
                    return Ok(());
                }
                info = collect_cluster_info(self.secrets.as_ref(), &self.config) => Some(info?),
            }
        } else {
            None
        };

        let watcher = self.watches_credentials().then(|| {
            tokio::spawn(watch_credentials(
                Arc::clone(&self.secrets),
                CredentialRef {
                    namespace: self.config.erda_namespace.clone(),
                    secret: self.config.access_key_secret.clone(),
                    field: self.config.access_key_field.clone(),
                },
                self.credentials.clone(),
                self.control.clone(),
                cancel.child_token(),
            ))
        });

        let retry = Duration::from_secs(self.config.retry_interval_secs);
        let mut dialed = false;
        loop {
            let Some(access_key) = self.credentials.wait_ready(&cancel).await else {
                break;
            };
            if dialed {
                self.control.inner.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            dialed = true;

            self.control.set_state(ConnectorState::Dialing);
            info!(url = %self.config.server_url, "connecting to dialer");
            let outcome = self
                .connect_and_run(&access_key, cluster_info.as_ref(), &cancel)
                .await;
            self.control.set_state(ConnectorState::Idle);

            match outcome {
                Ok(Disconnect::Cancelled) => break,
                Ok(Disconnect::Requested) => {
                    info!("reconnecting with the current access key");
                    continue;
                }
                Ok(Disconnect::Closed) => {
                    warn!("tunnel closed, reconnecting in {}s", retry.as_secs());
                }
                Err(e) => {
                    error!("failed to connect to dialer: {e}, retrying in {}s", retry.as_secs());
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(retry) => {}
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.control.set_state(ConnectorState::Stopped);
        info!("agent connector stopped");
        Ok(())
    }

    fn build_request(
        &self,
        access_key: &str,
        cluster_info: Option<&ClusterInfo>,
    ) -> Result<Request<()>, ConnectError> {
        let mut request = self.config.server_url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(HEADER_CLUSTER_KEY, HeaderValue::from_str(&self.config.cluster_key)?);

        let client_type = ClientType::parse(&self.config.client_type);
        if client_type != ClientType::Default {
            headers.insert(HEADER_CLIENT_TYPE, HeaderValue::from_str(client_type.as_str())?);
        }
        if let (false, Some(detail)) = (client_type.is_cluster(), &self.config.client_detail) {
            let detail = serde_json::to_string(detail)?;
            headers.insert(HEADER_CLIENT_DETAIL, HeaderValue::from_str(&detail)?);
        }
        if let Some(info) = cluster_info {
            headers.insert(HEADER_CLUSTER_INFO, HeaderValue::from_str(&info.to_header())?);
        }
        headers.insert(HEADER_AUTHORIZATION, HeaderValue::from_str(access_key)?);
        Ok(request)
    }

    /// One connection: dial, serve the tunnel, return why it ended.
    async fn connect_and_run(
        &self,
        access_key: &str,
        cluster_info: Option<&ClusterInfo>,
        cancel: &CancellationToken,
    ) -> Result<Disconnect, ConnectError> {
        let request = self.build_request(access_key, cluster_info)?;
        let timeout = Duration::from_secs(self.config.dial_timeout_secs);
        let (ws, _response) = tokio::select! {
            () = cancel.cancelled() => return Ok(Disconnect::Cancelled),
            res = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)) => {
                res.map_err(|_| ConnectError::Timeout(timeout))??
            }
        };
        let (mut ws_sink, mut ws_stream) = ws.split();

        // A request aimed at the previous connection means nothing now.
        self.control.take_disconnect_request();
        self.control.set_state(ConnectorState::Connected);

        // Rotations seen while dialing sent no disconnect request; any later
        // one will, now that the state is Connected.
        if self
            .credentials
            .current()
            .is_some_and(|current| current != access_key)
        {
            info!("access key rotated while dialing, reconnecting");
            let _ = ws_sink.send(Message::Close(None)).await;
            return Ok(Disconnect::Requested);
        }
        info!(cluster_key = %self.config.cluster_key, "tunnel connected");

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        let mux = Mux::new(out_tx.clone(), true);

        let send_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    Frame::Control(ctrl) => Message::Text(ctrl.to_json().into()),
                    Frame::Data(conn_id, data) => {
                        Message::Binary(encode_binary_frame(conn_id, &data).into())
                    }
                };
                if ws_sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            loop {
                interval.tick().await;
                if out_tx.send(Frame::Control(ControlMessage::Ping)).await.is_err() {
                    break;
                }
            }
        });

        let reason = loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break Disconnect::Cancelled,
                () = self.control.disconnect_requested() => break Disconnect::Requested,
                msg = ws_stream.next() => msg,
            };
            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!("tunnel read failed: {e}");
                    break Disconnect::Closed;
                }
                None => break Disconnect::Closed,
            };
            match msg {
                Message::Text(text) => match Frame::from_text(text.as_str()) {
                    Some(Frame::Control(ControlMessage::Pong)) => debug!("heartbeat acknowledged"),
                    Some(frame) => mux.handle_frame(frame).await,
                    None => debug!("ignoring unknown control message"),
                },
                Message::Binary(data) => match Frame::from_binary(&data) {
                    Some(frame) => mux.handle_frame(frame).await,
                    None => debug!("ignoring short binary frame"),
                },
                Message::Close(_) => break Disconnect::Closed,
                _ => {}
            }
        };

        heartbeat_task.abort();
        mux.shutdown().await;
        send_task.abort();
        info!(?reason, "tunnel disconnected");
        Ok(reason)
    }
}
