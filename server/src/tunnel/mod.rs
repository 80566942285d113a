//! Reverse tunnel between in-cluster agents and the dialer.
//!
//! One WebSocket per agent carries many logical connections:
//!
//! - **Text frames** are JSON [`ControlMessage`]s (`tunnel.connect`,
//!   `tunnel.connect.result`, `tunnel.close`, `tunnel.ping`, `tunnel.pong`).
//! - **Binary frames** are stream data: an 8-byte big-endian connection id
//!   followed by the payload.
//!
//! The dialer side ([`relay`]) opens connections through a [`session::Session`];
//! the agent side ([`client`]) dials the requested in-cluster address and pumps
//! bytes both ways. Both ends share the [`mux::Mux`] bookkeeping.

pub mod client;
pub mod mux;
pub mod protocol;
pub mod relay;
pub mod session;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Unix socket path reachable through a tunnel.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";
/// Windows named pipe reachable through a tunnel.
pub const DOCKER_PIPE: &str = "//./pipe/docker_engine";

/// JSON control message exchanged in text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Dialer → agent: open `address` over `proto` and bind it to `conn_id`.
    #[serde(rename = "tunnel.connect")]
    Connect {
        conn_id: u64,
        proto: String,
        address: String,
        timeout_ms: u64,
    },
    /// Agent → dialer: outcome of a `tunnel.connect`.
    #[serde(rename = "tunnel.connect.result")]
    ConnectResult {
        conn_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Either side: the connection is gone.
    #[serde(rename = "tunnel.close")]
    Close { conn_id: u64 },
    #[serde(rename = "tunnel.ping")]
    Ping,
    #[serde(rename = "tunnel.pong")]
    Pong,
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A decoded tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Data(u64, Bytes),
}

impl Frame {
    /// Parse a text frame. Unknown or malformed messages yield `None`.
    pub fn from_text(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok().map(Frame::Control)
    }

    /// Parse a binary frame.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        decode_binary_frame(data).map(|(id, payload)| Frame::Data(id, Bytes::copy_from_slice(payload)))
    }
}

/// Prefix `payload` with the big-endian connection id.
pub fn encode_binary_frame(conn_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&conn_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a binary frame into connection id and payload.
pub fn decode_binary_frame(data: &[u8]) -> Option<(u64, &[u8])> {
    let (head, payload) = data.split_at_checked(8)?;
    let id = u64::from_be_bytes(head.try_into().ok()?);
    Some((id, payload))
}

/// Whether a tunnel may open `address` over `proto`.
///
/// `tcp` is always allowed. `unix` and `npipe` are limited to the docker
/// engine endpoint.
pub fn connect_allowed(proto: &str, address: &str) -> bool {
    match proto {
        "tcp" => true,
        "unix" => address == DOCKER_SOCKET,
        "npipe" => address == DOCKER_PIPE,
        _ => false,
    }
}
