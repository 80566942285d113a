#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! clusterdialer library: reverse tunnel between firewalled clusters and
//! the control plane.
//!
//! - `agent` — in-cluster side: credential rotation, cluster info, leader gate
//! - `tunnel` — wire protocol, multiplexer, agent connector, dialer relay
//! - `auth` — tunnel authorization
//! - `directory` — etcd session-location directory
//! - `handshake` / `cluster_registry` — manage-config registration
//! - `netportal` — HTTP forwarding through a cluster's tunnel
//! - `client_detail` — metadata reported by non-cluster clients
//! - `config` — configuration loading
//! - `routes` — health endpoints

pub mod agent;
pub mod auth;
pub mod client_detail;
pub mod cluster_registry;
pub mod config;
pub mod directory;
pub mod handshake;
pub mod netportal;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use agent::{run_agent, AgentError};
pub use config::Config;
pub use state::{Collaborators, DialerState};
pub use tunnel::client::AgentConnector;
pub use tunnel::relay::dialer_router;
pub use tunnel::session::SessionRegistry;
