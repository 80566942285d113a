//! Shared dialer state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::auth::{Authorizer, CredentialAuthorizer};
use crate::client_detail::{ClientDetailRegistry, EventError, EventSink, HttpEventSink, LogEventSink};
use crate::cluster_registry::{ClusterRegistry, HttpClusterRegistry, MemoryClusterRegistry, RegistryError};
use crate::config::Config;
use crate::directory::{self, DirectoryError, EtcdDirectory, LocationDirectory, MemoryDirectory};
use crate::handshake::RegistrationHandshake;
use crate::netportal::Netportal;
use crate::tunnel::session::SessionRegistry;

/// Failure to assemble the dialer from configuration.
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Events(#[from] EventError),
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}

#[derive(Clone)]
pub struct DialerState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub sessions: SessionRegistry,
    pub authorizer: Arc<dyn Authorizer>,
    pub directory: Arc<dyn LocationDirectory>,
    pub handshake: RegistrationHandshake,
    pub client_details: ClientDetailRegistry,
    pub netportal: Netportal,
    /// IP written to the location directory for sessions held here.
    pub local_ip: Option<String>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

/// External collaborators, swappable for tests.
pub struct Collaborators {
    pub authorizer: Arc<dyn Authorizer>,
    pub directory: Arc<dyn LocationDirectory>,
    pub registry: Arc<dyn ClusterRegistry>,
    pub events: Arc<dyn EventSink>,
}

impl Collaborators {
    /// Build the configured adapters, falling back to in-memory ones for
    /// anything left unconfigured.
    pub async fn from_config(config: &Config) -> Result<Self, StateError> {
        let directory: Arc<dyn LocationDirectory> = match &config.etcd {
            Some(etcd) => Arc::new(EtcdDirectory::connect(etcd).await?),
            None => {
                warn!("no [etcd] configured, session locations are process-local");
                Arc::new(MemoryDirectory::default())
            }
        };
        let registry: Arc<dyn ClusterRegistry> = match &config.cluster_registry {
            Some(reg) => Arc::new(HttpClusterRegistry::new(reg)?),
            None => {
                warn!("no [cluster_registry] configured, cluster info is not persisted");
                Arc::new(MemoryClusterRegistry::default())
            }
        };
        let events: Arc<dyn EventSink> = match &config.events {
            Some(ev) => Arc::new(HttpEventSink::new(&ev.url)?),
            None => Arc::new(LogEventSink),
        };
        Ok(Self {
            authorizer: Arc::new(CredentialAuthorizer::from_config(&config.auth)),
            directory,
            registry,
            events,
        })
    }
}

impl DialerState {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self, StateError> {
        let server = &config.server;
        let sessions = SessionRegistry::new(Duration::from_secs(server.dial_timeout_secs));
        let handshake = RegistrationHandshake::new(
            sessions.clone(),
            collaborators.registry,
            Duration::from_millis(server.register_timeout_ms),
            Duration::from_millis(server.register_check_interval_ms),
        );
        let netportal = Netportal::new(
            sessions.clone(),
            Duration::from_secs(server.timeout_secs),
            server.insecure_skip_verify,
        )?;
        let local_ip = directory::local_ip(server.advertise_ip.as_deref());
        match &local_ip {
            Some(ip) => info!("advertising {ip} in the location directory"),
            None => warn!("no local IP found, location directory will not be updated"),
        }

        Ok(Self {
            config: Arc::new(config),
            sessions,
            authorizer: collaborators.authorizer,
            directory: collaborators.directory,
            handshake,
            client_details: ClientDetailRegistry::new(collaborators.events),
            netportal,
            local_ip,
            start_time: Instant::now(),
        })
    }
}
