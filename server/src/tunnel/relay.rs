//! Dialer side of the tunnel: accepts agent upgrades and serves the
//! control-plane endpoints.
//!
//! `/clusteragent/connect` runs the full registration protocol:
//! 1. Validate `X-Erda-Cluster-Key` and derive the session key from the client type
//! 2. Record `session key → this replica's IP` in the location directory (best-effort)
//! 3. Cluster clients: require and decode `X-Erda-Cluster-Info` + `Authorization`
//! 4. Authorize via the configured [`Authorizer`](crate::auth::Authorizer)
//! 5. Other clients: upsert the optional `X-Erda-Cluster-Detail` object
//! 6. Upgrade, index the session, and start the registration handshake
//!
//! `/clusterdialer` only authorizes and upgrades.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::mux::Mux;
use super::protocol::{
    ClientType, ClusterInfo, DETAIL_KEY_CLUSTER_KEY, HEADER_AUTHORIZATION, HEADER_CLIENT_DETAIL,
    HEADER_CLIENT_TYPE, HEADER_CLUSTER_INFO, HEADER_CLUSTER_KEY,
};
use super::session::SessionRegistry;
use super::{encode_binary_frame, ControlMessage, Frame};
use crate::auth::header_str;
use crate::client_detail::{self, ClientDetail};
use crate::state::DialerState;
use crate::{directory, netportal, routes};

/// Build the dialer router with all endpoints.
pub fn dialer_router(state: DialerState) -> Router {
    Router::new()
        .route("/clusteragent/connect", any(cluster_connect))
        .route("/clusteragent/check", get(check_cluster))
        .route(
            "/clusteragent/client-detail/{client_type}/{cluster_key}",
            get(client_detail::get_client_detail),
        )
        .route(
            "/clusteragent/client-detail/{client_type}",
            get(client_detail::list_client_details),
        )
        .route("/clusteragent/sessions", get(list_sessions))
        .route("/clusteragent/health", get(routes::health::health))
        .route("/clusterdialer", any(raw_connect))
        .route("/clusterdialer/ip", get(directory::query_ip))
        .fallback(netportal::netportal)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically evict sessions that stopped sending heartbeats.
pub fn spawn_sweeper(sessions: SessionRegistry, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            sessions.sweep(timeout).await;
        }
    })
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

async fn cluster_connect(
    State(state): State<DialerState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let raw_key = header_str(&headers, HEADER_CLUSTER_KEY);
    if raw_key.is_empty() {
        return bad_request(format!("missing header:{HEADER_CLUSTER_KEY}"));
    }
    let client_type = ClientType::parse(header_str(&headers, HEADER_CLIENT_TYPE));
    let cluster_key = client_type.make_client_key(raw_key);

    if let Some(ip) = &state.local_ip {
        if let Err(e) = state.directory.put(&cluster_key, ip).await {
            error!(cluster_key, "failed to record session location: {e}");
        }
    }

    let mut cluster_info = None;
    if client_type.is_cluster() && state.config.server.need_cluster_info {
        let info = header_str(&headers, HEADER_CLUSTER_INFO);
        if info.is_empty() {
            return bad_request(format!("missing header:{HEADER_CLUSTER_INFO}"));
        }
        if header_str(&headers, HEADER_AUTHORIZATION).is_empty() {
            return bad_request(format!("missing header:{HEADER_AUTHORIZATION}"));
        }
        match ClusterInfo::from_header(info) {
            Ok(info) => cluster_info = Some(info),
            Err(e) => return bad_request(e.to_string()),
        }
    }

    let session_key = match state.authorizer.authorize(&headers) {
        Ok(key) => key,
        Err(e) => {
            warn!(cluster_key, status = e.status.as_u16(), "tunnel authorization failed: {e}");
            return e.into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    if !client_type.is_cluster() {
        if let Some(detail) = decode_detail(&headers, raw_key, &client_type, &session_key) {
            state
                .client_details
                .upsert(client_type.as_str(), &session_key, detail);
        }
        info!(cluster_key = %session_key, client_type = %client_type, "client connecting");
    }

    if let Some(info) = cluster_info {
        state.handshake.spawn(session_key.clone(), info);
    }

    upgrade(ws, state, session_key)
}

/// Decode `X-Erda-Cluster-Detail`, tagging it with the raw cluster key.
/// Malformed detail is logged and skipped.
fn decode_detail(
    headers: &HeaderMap,
    raw_key: &str,
    client_type: &ClientType,
    session_key: &str,
) -> Option<ClientDetail> {
    let raw = header_str(headers, HEADER_CLIENT_DETAIL);
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<ClientDetail>(raw) {
        Ok(mut detail) => {
            detail.insert(DETAIL_KEY_CLUSTER_KEY.to_string(), json!(raw_key));
            Some(detail)
        }
        Err(e) => {
            error!(
                client_type = %client_type,
                cluster_key = session_key,
                "failed to decode client detail (skip update): {e}"
            );
            None
        }
    }
}

async fn raw_connect(
    State(state): State<DialerState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let session_key = match state.authorizer.authorize(&headers) {
        Ok(key) => key,
        Err(e) => {
            warn!(status = e.status.as_u16(), "tunnel authorization failed: {e}");
            return e.into_response();
        }
    };
    match ws {
        Ok(ws) => upgrade(ws, state, session_key),
        Err(rejection) => rejection.into_response(),
    }
}

fn upgrade(ws: WebSocketUpgrade, state: DialerState, cluster_key: String) -> Response {
    info!(cluster_key = %cluster_key, "agent connecting...");
    ws.on_upgrade(move |socket| {
        let span = info_span!("tunnel_session", cluster_key = %cluster_key);
        run_session(socket, state, cluster_key).instrument(span)
    })
}

/// Drive one agent socket until it closes or the session is replaced.
async fn run_session(socket: WebSocket, state: DialerState, cluster_key: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
    let mux = Mux::new(out_tx.clone(), false);
    let session = state.sessions.register(&cluster_key, Arc::clone(&mux)).await;

    // Forward mux output to the WS sink
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

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            () = mux.closed() => {
                info!("session handler shutting down (replaced or evicted)");
                break;
            }
        };
        match msg {
            Message::Text(text) => match Frame::from_text(text.as_str()) {
                Some(Frame::Control(ControlMessage::Ping)) => {
                    state.sessions.touch(&session);
                    let _ = out_tx.send(Frame::Control(ControlMessage::Pong)).await;
                }
                Some(frame) => mux.handle_frame(frame).await,
                None => debug!("ignoring unknown control message"),
            },
            Message::Binary(data) => match Frame::from_binary(&data) {
                Some(frame) => mux.handle_frame(frame).await,
                None => debug!("ignoring short binary frame"),
            },
            Message::Ping(_) | Message::Pong(_) => state.sessions.touch(&session),
            Message::Close(_) => break,
        }
    }

    state.sessions.remove(&session).await;
    mux.shutdown().await;
    send_task.abort();
    info!("agent disconnected");
}

#[derive(Deserialize)]
struct CheckQuery {
    #[serde(rename = "clusterKey", default)]
    cluster_key: String,
    #[serde(rename = "clientType", default)]
    client_type: String,
}

/// `GET /clusteragent/check`: literal `true`/`false`.
async fn check_cluster(
    State(state): State<DialerState>,
    Query(query): Query<CheckQuery>,
) -> String {
    let key = ClientType::parse(&query.client_type).make_client_key(&query.cluster_key);
    state.sessions.has_session(&key).await.to_string()
}

/// `GET /clusteragent/sessions`.
async fn list_sessions(State(state): State<DialerState>) -> Response {
    Json(json!({"sessions": state.sessions.list().await})).into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    use axum::body::Body;
    use axum::http::Request;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::agent::secret::{MemorySecretStore, Secret};
    use crate::auth::{AuthError, Authorizer, CredentialAuthorizer};
    use crate::client_detail::LogEventSink;
    use crate::cluster_registry::{Cluster, ManageConfig, MemoryClusterRegistry, MANAGE_PROXY};
    use crate::config::{AgentConfig, AuthConfig, Config, CredentialEntry};
    use crate::directory::{LocationDirectory, MemoryDirectory};
    use crate::state::Collaborators;
    use crate::tunnel::client::AgentConnector;

    /// Delegates to the credential table, remembering every presented key.
    struct RecordingAuthorizer {
        inner: CredentialAuthorizer,
        seen: StdMutex<Vec<String>>,
    }

    impl RecordingAuthorizer {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Authorizer for RecordingAuthorizer {
        fn authorize(&self, headers: &HeaderMap) -> Result<String, AuthError> {
            self.seen
                .lock()
                .unwrap()
                .push(header_str(headers, HEADER_AUTHORIZATION).to_string());
            self.inner.authorize(headers)
        }
    }

    struct Dialer {
        state: DialerState,
        auth: Arc<RecordingAuthorizer>,
        registry: Arc<MemoryClusterRegistry>,
        directory: Arc<MemoryDirectory>,
        addr: SocketAddr,
    }

    async fn dialer() -> Dialer {
        let mut config = Config::default();
        config.server.need_cluster_info = true;
        config.server.advertise_ip = Some("10.0.0.5".into());
        config.server.register_check_interval_ms = 20;
        config.auth = AuthConfig {
            skip_auth: false,
            credentials: vec![
                CredentialEntry {
                    access_key: "k1".into(),
                    cluster_key: "c1".into(),
                },
                CredentialEntry {
                    access_key: "k2".into(),
                    cluster_key: "*".into(),
                },
            ],
        };

        let auth = Arc::new(RecordingAuthorizer {
            inner: CredentialAuthorizer::from_config(&config.auth),
            seen: StdMutex::new(Vec::new()),
        });
        let registry = Arc::new(MemoryClusterRegistry::default());
        registry
            .insert(Cluster {
                name: "c1".into(),
                manage_config: None,
            })
            .await;
        let directory = Arc::new(MemoryDirectory::default());
        let state = DialerState::new(
            config,
            Collaborators {
                authorizer: auth.clone(),
                directory: directory.clone(),
                registry: registry.clone(),
                events: Arc::new(LogEventSink),
            },
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = dialer_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Dialer {
            state,
            auth,
            registry,
            directory,
            addr,
        }
    }

    async fn upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/hello", get(|| async { "Hello, world!" }));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn credential(key: &str) -> Secret {
        let config = AgentConfig::default();
        Secret {
            name: config.access_key_secret,
            data: BTreeMap::from([(config.access_key_field, key.as_bytes().to_vec())]),
            ..Secret::default()
        }
    }

    fn agent(addr: SocketAddr) -> (AgentConnector, Arc<MemorySecretStore>) {
        let mut config = AgentConfig::default();
        config.server_url = format!("ws://{addr}/clusteragent/connect");
        config.cluster_key = "c1".into();
        config.client_type = "cluster-agent".into();
        config.retry_interval_secs = 1;

        let store = Arc::new(MemorySecretStore::default());
        store.put(
            &config.erda_namespace,
            Secret {
                name: config.token_secret_name.clone(),
                data: BTreeMap::from([
                    ("token".to_string(), b"tok".to_vec()),
                    ("ca.crt".to_string(), b"ca".to_vec()),
                ]),
                ..Secret::default()
            },
        );
        store.put(&config.erda_namespace, credential("k1"));
        (AgentConnector::new(config, store.clone()), store)
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{what} did not happen within 5s");
    }

    async fn check(addr: SocketAddr, key: &str) -> String {
        reqwest::get(format!("http://{addr}/clusteragent/check?clusterKey={key}"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_registers_and_netportal_round_trips() {
        let dialer = dialer().await;
        let upstream = upstream().await;
        assert_eq!(check(dialer.addr, "c1").await, "false");

        let (connector, _store) = agent(dialer.addr);
        let connector = Arc::new(connector);
        let cancel = CancellationToken::new();
        let task = {
            let (connector, cancel) = (connector.clone(), cancel.clone());
            tokio::spawn(async move { connector.start(cancel).await })
        };

        eventually("session registration", || async {
            check(dialer.addr, "c1").await == "true"
        })
        .await;
        assert_eq!(
            dialer.directory.get("c1").await.unwrap().as_deref(),
            Some("10.0.0.5")
        );

        let resp = reqwest::Client::new()
            .get(format!("http://{}/hello", dialer.addr))
            .header("X-Portal-Host", "c1")
            .header("X-Portal-Dest", upstream.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "Hello, world!");

        eventually("manage-config patch", || async {
            dialer.registry.patch_count() == 1
        })
        .await;
        let manage = dialer.registry.manage_config("c1").await.unwrap();
        assert_eq!(
            manage,
            ManageConfig {
                kind: MANAGE_PROXY.into(),
                address: "https://kubernetes.default.svc:443".into(),
                ca_data: "Y2E=".into(),
                token: "tok".into(),
                credential_source: MANAGE_PROXY.into(),
            }
        );

        let sessions: serde_json::Value = reqwest::get(format!("http://{}/clusteragent/sessions", dialer.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sessions["sessions"][0]["cluster_key"], "c1");

        cancel.cancel();
        task.await.unwrap().unwrap();
        eventually("session removal", || async {
            check(dialer.addr, "c1").await == "false"
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rotated_key_reconnects_and_delete_does_not() {
        let dialer = dialer().await;
        let (connector, store) = agent(dialer.addr);
        let connector = Arc::new(connector);
        let namespace = AgentConfig::default().erda_namespace;
        let cancel = CancellationToken::new();
        let task = {
            let (connector, cancel) = (connector.clone(), cancel.clone());
            tokio::spawn(async move { connector.start(cancel).await })
        };

        eventually("first connection", || async { connector.control().is_connected() }).await;
        assert_eq!(dialer.auth.seen(), vec!["k1".to_string()]);

        store.put(&namespace, credential("k2"));
        eventually("reconnect with k2", || async {
            connector.control().is_connected() && dialer.auth.seen().last().map(String::as_str) == Some("k2")
        })
        .await;
        eventually("session under new key", || async {
            check(dialer.addr, "c1").await == "true"
        })
        .await;
        assert_eq!(connector.control().reconnects(), 1);
        assert_eq!(connector.credentials().current().as_deref(), Some("k2"));

        let attempts = dialer.auth.seen().len();
        store.delete(&namespace, &AgentConfig::default().access_key_secret);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(connector.control().is_connected());
        assert_eq!(dialer.auth.seen().len(), attempts);
        assert_eq!(connector.control().reconnects(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_validates_headers_before_upgrade() {
        let dialer = dialer().await;
        let send = |req: Request<Body>| dialer_router(dialer.state.clone()).oneshot(req);

        let resp = send(Request::get("/clusteragent/connect").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            Request::get("/clusteragent/connect")
                .header(HEADER_CLUSTER_KEY, "c1")
                .header(HEADER_AUTHORIZATION, "k1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            Request::get("/clusteragent/connect")
                .header(HEADER_CLUSTER_KEY, "c1")
                .header(HEADER_CLUSTER_INFO, "not base64!")
                .header(HEADER_AUTHORIZATION, "k1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let info = ClusterInfo {
            address: "https://kubernetes.default.svc:443".into(),
            token: "tok".into(),
            ca_cert: "Y2E=".into(),
        };
        let resp = send(
            Request::get("/clusteragent/connect")
                .header(HEADER_CLUSTER_KEY, "c1")
                .header(HEADER_CLUSTER_INFO, info.to_header())
                .header(HEADER_AUTHORIZATION, "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        // Location is recorded before authorization.
        assert_eq!(
            dialer.directory.get("c1").await.unwrap().as_deref(),
            Some("10.0.0.5")
        );
    }

    #[tokio::test]
    async fn other_client_types_skip_cluster_info_and_record_detail() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let dialer = dialer().await;
        let mut request = format!("ws://{}/clusteragent/connect", dialer.addr)
            .into_client_request()
            .unwrap();
        let headers = request.headers_mut();
        headers.insert(HEADER_CLUSTER_KEY, "c9".parse().unwrap());
        headers.insert(HEADER_CLIENT_TYPE, "edge".parse().unwrap());
        headers.insert(HEADER_AUTHORIZATION, "Bearer k2".parse().unwrap());
        headers.insert(HEADER_CLIENT_DETAIL, r#"{"version":"1.2"}"#.parse().unwrap());
        let (_ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let detail = dialer.state.client_details.get("edge", "edge-c9").unwrap();
        assert_eq!(detail["version"], "1.2");
        assert_eq!(detail[DETAIL_KEY_CLUSTER_KEY], "c9");

        eventually("edge session", || async {
            reqwest::get(format!(
                "http://{}/clusteragent/check?clusterKey=c9&clientType=edge",
                dialer.addr
            ))
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
                == "true"
        })
        .await;
        let resp = reqwest::get(format!(
            "http://{}/clusteragent/client-detail/edge/c9",
            dialer.addr
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        // No cluster info, so no registration handshake.
        assert_eq!(dialer.registry.patch_count(), 0);
    }

    #[tokio::test]
    async fn raw_dialer_requires_authorization() {
        let dialer = dialer().await;
        let resp = dialer_router(dialer.state.clone())
            .oneshot(
                Request::get("/clusterdialer")
                    .header(HEADER_CLUSTER_KEY, "c1")
                    .header(HEADER_AUTHORIZATION, "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn netportal_without_session_is_not_found() {
        let dialer = dialer().await;
        let resp = dialer_router(dialer.state.clone())
            .oneshot(
                Request::get("/anything")
                    .header("X-Portal-Host", "ghost")
                    .header("X-Portal-Dest", "127.0.0.1:80")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
