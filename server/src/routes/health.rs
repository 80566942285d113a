//! Unauthenticated health-check endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::DialerState;
use crate::tunnel::client::ConnectionControl;

/// `GET /clusteragent/health` — dialer liveness probe.
///
/// Returns status, uptime, version, and the number of live tunnel sessions.
pub async fn health(State(state): State<DialerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len().await,
    }))
}

/// `GET /healthz` — agent liveness probe.
pub async fn healthz(State(control): State<ConnectionControl>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "state": control.state(),
        "connected": control.is_connected(),
        "reconnects": control.reconnects(),
    }))
}
