//! Tunnel upgrade authentication.
//!
//! Agents present their access key in the `Authorization` header, either raw
//! or as `Bearer <key>`. Each configured key may register one cluster key
//! (or any, with `*`).

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::tunnel::protocol::{ClientType, HEADER_AUTHORIZATION, HEADER_CLIENT_TYPE, HEADER_CLUSTER_KEY};

/// Rejected upgrade, carrying the status the relay writes back as-is.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthError {
    pub status: StatusCode,
    pub message: String,
}

impl AuthError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Decides whether an upgrade request may open a session.
pub trait Authorizer: Send + Sync {
    /// Returns the session key the caller may register.
    fn authorize(&self, headers: &HeaderMap) -> Result<String, AuthError>;
}

/// Access-key → cluster-key table from `[auth]`.
pub struct CredentialAuthorizer {
    skip_auth: bool,
    credentials: Vec<(String, String)>,
}

impl CredentialAuthorizer {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            skip_auth: config.skip_auth,
            credentials: config
                .credentials
                .iter()
                .map(|c| (c.access_key.clone(), c.cluster_key.clone()))
                .collect(),
        }
    }
}

impl Authorizer for CredentialAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let cluster_key = header_str(headers, HEADER_CLUSTER_KEY);
        if cluster_key.is_empty() {
            return Err(AuthError {
                status: StatusCode::BAD_REQUEST,
                message: format!("missing header:{HEADER_CLUSTER_KEY}"),
            });
        }
        let session_key =
            ClientType::parse(header_str(headers, HEADER_CLIENT_TYPE)).make_client_key(cluster_key);
        if self.skip_auth {
            return Ok(session_key);
        }

        let provided = header_str(headers, HEADER_AUTHORIZATION);
        let provided = provided.strip_prefix("Bearer ").unwrap_or(provided);
        if provided.is_empty() {
            return Err(AuthError::unauthorized("missing access key"));
        }

        // Check every entry so timing doesn't reveal which one matched.
        let mut allowed = false;
        for (access_key, allowed_cluster) in &self.credentials {
            let key_ok = constant_time_eq(access_key.as_bytes(), provided.as_bytes());
            let cluster_ok = allowed_cluster == "*" || allowed_cluster == cluster_key;
            allowed |= key_ok && cluster_ok;
        }
        if allowed {
            Ok(session_key)
        } else {
            Err(AuthError::unauthorized(format!(
                "access key not valid for cluster {cluster_key}"
            )))
        }
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or("", str::trim)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}
