//! Registration headers, client types, and the cluster-info payload.

use std::fmt;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const HEADER_CLUSTER_KEY: &str = "X-Erda-Cluster-Key";
pub const HEADER_CLIENT_TYPE: &str = "X-Erda-Client-Type";
pub const HEADER_CLUSTER_INFO: &str = "X-Erda-Cluster-Info";
pub const HEADER_CLIENT_DETAIL: &str = "X-Erda-Cluster-Detail";
pub const HEADER_AUTHORIZATION: &str = "Authorization";

/// Detail key carrying the raw (unprefixed) cluster key.
pub const DETAIL_KEY_CLUSTER_KEY: &str = "clusterKey";

/// Kind of agent on the other end of a tunnel.
///
/// Default and cluster agents share the raw cluster key as session key; any
/// other type gets a `"{type}-"` prefix so namespaces never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientType {
    Default,
    Cluster,
    Other(String),
}

impl ClientType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" => Self::Default,
            "cluster-agent" => Self::Cluster,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Default => "",
            Self::Cluster => "cluster-agent",
            Self::Other(s) => s,
        }
    }

    /// Whether this client registers cluster connectivity (vs. free-form detail).
    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Default | Self::Cluster)
    }

    /// Session key for `cluster_key` under this client type.
    pub fn make_client_key(&self, cluster_key: &str) -> String {
        match self {
            Self::Default | Self::Cluster => cluster_key.to_string(),
            Self::Other(t) => format!("{t}-{cluster_key}"),
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// In-cluster API endpoint and credentials reported at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub address: String,
    pub token: String,
    #[serde(rename = "caCert")]
    pub ca_cert: String,
}

/// Why an `X-Erda-Cluster-Info` header was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClusterInfoError {
    #[error("invalid cluster info encoding: {0}")]
    Encoding(String),
    #[error("invalid cluster info json: {0}")]
    Json(String),
    #[error("invalid cluster info, {0} empty")]
    Empty(&'static str),
}

impl ClusterInfo {
    /// Base64(JSON) form used in the registration header.
    pub fn to_header(&self) -> String {
        B64.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode and validate the registration header. Every field must be set.
    pub fn from_header(value: &str) -> Result<Self, ClusterInfoError> {
        let raw = B64
            .decode(value.trim())
            .map_err(|e| ClusterInfoError::Encoding(e.to_string()))?;
        let info: ClusterInfo =
            serde_json::from_slice(&raw).map_err(|e| ClusterInfoError::Json(e.to_string()))?;
        if info.address.is_empty() {
            return Err(ClusterInfoError::Empty("address"));
        }
        if info.token.is_empty() {
            return Err(ClusterInfoError::Empty("token"));
        }
        if info.ca_cert.is_empty() {
            return Err(ClusterInfoError::Empty("caCert"));
        }
        Ok(info)
    }
}
