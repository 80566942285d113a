//! Netportal: forward plain HTTP requests into a cluster through its tunnel.
//!
//! Callers address the target with four headers:
//!
//! | Header             | Meaning                                   |
//! |--------------------|-------------------------------------------|
//! | `X-Portal-Host`    | cluster key (selects the session)         |
//! | `X-Portal-Dest`    | `host:port` inside the cluster            |
//! | `X-Portal-Scheme`  | `http` (default) or `https`               |
//! | `X-Portal-Timeout` | request timeout in seconds (optional)     |
//!
//! The headers are stripped, the request is re-targeted to
//! `scheme://dest/path?query`, and the upstream response is streamed back.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::{error, info};

use crate::state::DialerState;
use crate::tunnel::session::SessionRegistry;

pub const PORTAL_HOST_HEADER: &str = "X-Portal-Host";
pub const PORTAL_DEST_HEADER: &str = "X-Portal-Dest";
pub const PORTAL_SCHEME_HEADER: &str = "X-Portal-Scheme";
pub const PORTAL_TIMEOUT_HEADER: &str = "X-Portal-Timeout";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A tunneled connection, optionally wrapped in TLS.
enum PortalStream {
    Plain(DuplexStream),
    Tls(Box<tokio_native_tls::TlsStream<DuplexStream>>),
}

impl AsyncRead for PortalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PortalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// hyper-facing side of a [`PortalStream`].
pub struct PortalIo(TokioIo<PortalStream>);

impl hyper::rt::Read for PortalIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().0), cx, buf)
    }
}

impl hyper::rt::Write for PortalIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().0), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().0), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
    }
}

impl Connection for PortalIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// hyper connector whose "dial" opens a connection through a cluster's
/// tunnel session. The session is looked up on every dial so a reconnected
/// agent is picked up by an already cached client.
#[derive(Clone)]
pub struct TunnelConnector {
    sessions: SessionRegistry,
    cluster_key: String,
    tls: tokio_native_tls::TlsConnector,
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = PortalIo;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<PortalIo, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let host = uri.host().ok_or("request uri has no host")?.to_string();
            let https = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

            let session = this
                .sessions
                .get(&this.cluster_key)
                .await
                .ok_or_else(|| format!("cluster {} not connected", this.cluster_key))?;
            let conn = session.dial("tcp", &format!("{host}:{port}")).await?;

            let stream = if https {
                PortalStream::Tls(Box::new(this.tls.connect(&host, conn).await?))
            } else {
                PortalStream::Plain(conn)
            };
            Ok::<_, BoxError>(PortalIo(TokioIo::new(stream)))
        })
    }
}

type PortalClient = Client<TunnelConnector, Body>;

/// Fail `body` with a timeout error once `deadline` passes, so the request
/// timeout covers streaming the response as well as its headers.
fn deadline_body(body: Body, deadline: tokio::time::Instant) -> Body {
    let expiry = Box::pin(tokio::time::sleep_until(deadline));
    let chunks = futures::stream::unfold(
        Some((body.into_data_stream(), expiry)),
        |state| async move {
            let (mut data, mut expiry) = state?;
            tokio::select! {
                chunk = data.next() => chunk.map(|c| (c, Some((data, expiry)))),
                () = &mut expiry => {
                    let err = io::Error::new(io::ErrorKind::TimedOut, "netportal response deadline exceeded");
                    Some((Err(axum::Error::new(err)), None))
                }
            }
        },
    );
    Body::from_stream(chunks)
}

/// Forwarding proxy with one cached client per cluster key.
#[derive(Clone)]
pub struct Netportal {
    sessions: SessionRegistry,
    default_timeout: Duration,
    tls: tokio_native_tls::TlsConnector,
    clients: Arc<Mutex<HashMap<String, PortalClient>>>,
    counter: Arc<AtomicU64>,
}

impl Netportal {
    /// `insecure_skip_verify` disables upstream certificate and hostname
    /// checks for `https` targets inside the cluster.
    pub fn new(
        sessions: SessionRegistry,
        default_timeout: Duration,
        insecure_skip_verify: bool,
    ) -> Result<Self, native_tls::Error> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(insecure_skip_verify)
            .danger_accept_invalid_hostnames(insecure_skip_verify)
            .build()?;
        Ok(Self {
            sessions,
            default_timeout,
            tls: tls.into(),
            clients: Arc::new(Mutex::new(HashMap::new())),
            counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Timeouts are applied per request, so they never split the cache.
    fn client(&self, cluster_key: &str) -> PortalClient {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients
            .entry(cluster_key.to_string())
            .or_insert_with(|| {
                let connector = TunnelConnector {
                    sessions: self.sessions.clone(),
                    cluster_key: cluster_key.to_string(),
                    tls: self.tls.clone(),
                };
                Client::builder(TokioExecutor::new())
                    .pool_idle_timeout(Duration::from_secs(90))
                    .build(connector)
            })
            .clone()
    }

    pub fn cached_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forward one request. See the module docs for the header contract.
    pub async fn forward(&self, req: Request) -> Response {
        let (mut parts, body) = req.into_parts();
        let target = match PortalTarget::take_from(&mut parts.headers, self.default_timeout) {
            Ok(t) => t,
            Err(resp) => return resp,
        };

        if !self.sessions.has_session(&target.cluster_key).await {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("cluster {} not connected", target.cluster_key),
            );
        }

        let mut url = format!("{}://{}{}", target.scheme, target.dest, parts.uri.path());
        if let Some(q) = parts.uri.query() {
            url.push('?');
            url.push_str(q);
        }
        let uri: Uri = match url.parse() {
            Ok(u) => u,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid target {url}: {e}")),
        };

        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let cluster_key = target.cluster_key.as_str();
        info!(
            id,
            cluster_key,
            timeout_secs = target.timeout.as_secs(),
            %url,
            "netportal request"
        );

        parts.headers.remove(header::HOST);
        if let Some(authority) = uri.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(header::HOST, host);
            }
        }
        parts.uri = uri;
        let outbound = Request::from_parts(parts, body);

        let client = self.client(cluster_key);
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + target.timeout;
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = || start.elapsed().as_millis() as u64;
        match tokio::time::timeout_at(deadline, client.request(outbound)).await {
            Ok(Ok(resp)) => {
                info!(
                    id,
                    cluster_key,
                    status = resp.status().as_u16(),
                    latency_ms = latency_ms(),
                    "netportal response"
                );
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, deadline_body(Body::new(body), deadline))
            }
            Ok(Err(e)) => {
                let reason = std::error::Error::source(&e)
                    .map_or_else(|| e.to_string(), |s| format!("{e}: {s}"));
                error!(id, cluster_key, latency_ms = latency_ms(), %url, "netportal request failed: {reason}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, reason)
            }
            Err(_) => {
                error!(id, cluster_key, latency_ms = latency_ms(), %url, "netportal request timed out");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("request to {url} timed out after {}s", target.timeout.as_secs()),
                )
            }
        }
    }
}

/// Target parsed out of (and removed from) the portal headers.
#[derive(Debug, PartialEq, Eq)]
struct PortalTarget {
    cluster_key: String,
    dest: String,
    scheme: String,
    timeout: Duration,
}

impl PortalTarget {
    fn take_from(headers: &mut HeaderMap, default_timeout: Duration) -> Result<Self, Response> {
        let mut take = |name: &str| {
            headers
                .remove(name)
                .and_then(|v| v.to_str().ok().map(|s| s.trim().to_string()))
                .unwrap_or_default()
        };
        let cluster_key = take(PORTAL_HOST_HEADER);
        let dest = take(PORTAL_DEST_HEADER);
        let scheme = take(PORTAL_SCHEME_HEADER);
        let timeout = take(PORTAL_TIMEOUT_HEADER);

        if cluster_key.is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("missing header:{PORTAL_HOST_HEADER}"),
            ));
        }
        if dest.is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("missing header:{PORTAL_DEST_HEADER}"),
            ));
        }
        // An unparseable override falls back to the default.
        let timeout = timeout
            .parse::<u64>()
            .map_or(default_timeout, Duration::from_secs);
        Ok(Self {
            cluster_key,
            dest,
            scheme: if scheme.is_empty() { "http".to_string() } else { scheme },
            timeout,
        })
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

/// Catch-all route handler.
pub async fn netportal(State(state): State<DialerState>, req: Request) -> Response {
    state.netportal.forward(req).await
}
