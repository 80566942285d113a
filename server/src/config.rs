//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — see [`Config::apply_env`]
//! 2. **Config file** — path via `--config <path>`, or `clusterdialer.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [server]
//! listen = "0.0.0.0:80"
//! need_cluster_info = true
//! timeout_secs = 60                 # default netportal timeout
//! heartbeat_timeout_secs = 90
//! register_timeout_ms = 5000
//! register_check_interval_ms = 1000
//! insecure_skip_verify = true       # TLS verification inside the tunnel
//!
//! [auth]
//! skip_auth = false
//! credentials = [{ access_key = "ak-1", cluster_key = "prod-1" }]
//!
//! [etcd]
//! endpoints = ["http://127.0.0.1:2379"]
//!
//! [cluster_registry]
//! url = "http://cluster-manager:9094"
//!
//! [agent]
//! server_url = "ws://cluster-dialer/clusteragent/connect"
//! cluster_key = "prod-1"
//! collect_cluster_info = true
//! retry_interval_secs = 2
//!
//! [agent.leader_election]
//! enabled = true
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Location directory backend. `None` keeps locations in process memory.
    pub etcd: Option<EtcdConfig>,
    /// Cluster registry that receives manage-config patches.
    pub cluster_registry: Option<ClusterRegistryConfig>,
    /// Optional webhook for "client registered" events.
    pub events: Option<EventsConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Dialer server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:80`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Require `X-Erda-Cluster-Info` + `Authorization` from cluster-type agents.
    #[serde(default = "default_true")]
    pub need_cluster_info: bool,
    /// Default netportal request timeout in seconds (default 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds before a session is evicted for missed heartbeat (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Upper bound on waiting for a session before registration gives up.
    #[serde(default = "default_register_timeout_ms")]
    pub register_timeout_ms: u64,
    /// Interval between session checks during registration.
    #[serde(default = "default_register_check_interval_ms")]
    pub register_check_interval_ms: u64,
    /// Timeout for opening one logical connection through a session.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Skip upstream TLS verification for `https` netportal targets. The
    /// tunnel itself is the trust boundary, so this defaults to `true`.
    #[serde(default = "default_true")]
    pub insecure_skip_verify: bool,
    /// IP recorded in the location directory. Falls back to `POD_IP`, then
    /// to the first non-loopback IPv4 interface address.
    pub advertise_ip: Option<String>,
}

/// Tunnel authentication.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Accept every upgrade without checking `Authorization`.
    #[serde(default)]
    pub skip_auth: bool,
    /// Access keys and the cluster key each one may register.
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

/// One accepted access key. `cluster_key = "*"` allows any cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialEntry {
    pub access_key: String,
    pub cluster_key: String,
}

/// etcd v3 cluster settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    /// Client endpoints, load-balanced (e.g. `http://etcd:2379`).
    pub endpoints: Vec<String>,
    #[serde(default = "default_etcd_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_etcd_timeout")]
    pub request_timeout_secs: u64,
}

/// Cluster-manager REST endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterRegistryConfig {
    pub url: String,
    #[serde(default = "default_registry_timeout")]
    pub request_timeout_secs: u64,
}

/// Event webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    pub url: String,
}

/// In-cluster agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Connect endpoint of the dialer, e.g. `wss://dialer.example.com/clusteragent/connect`.
    #[serde(default)]
    pub server_url: String,
    /// Cluster key sent as `X-Erda-Cluster-Key`.
    #[serde(default)]
    pub cluster_key: String,
    /// Client type sent as `X-Erda-Client-Type` (empty = default).
    #[serde(default)]
    pub client_type: String,
    /// Optional JSON object sent as `X-Erda-Cluster-Detail` by non-default client types.
    pub client_detail: Option<serde_json::Map<String, serde_json::Value>>,
    /// Send `X-Erda-Cluster-Info` + `Authorization` on every connect.
    #[serde(default = "default_true")]
    pub collect_cluster_info: bool,
    /// Static access key. When set, the credential secret is not watched.
    pub access_key: Option<String>,
    /// Secret holding the rotating access key.
    #[serde(default = "default_access_key_secret")]
    pub access_key_secret: String,
    /// Data field of the access key inside `access_key_secret`.
    #[serde(default = "default_access_key_field")]
    pub access_key_field: String,
    /// Namespace the agent runs in.
    #[serde(default = "default_namespace")]
    pub erda_namespace: String,
    #[serde(default = "default_service_account")]
    pub service_account: String,
    /// Service-account token secret read for cluster info.
    #[serde(default = "default_token_secret")]
    pub token_secret_name: String,
    /// In-cluster API server address reported to the dialer.
    #[serde(default = "default_api_server")]
    pub api_server_address: String,
    /// Seconds to wait before redialing after a failure (default 2).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Seconds between `tunnel.ping` heartbeats (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Timeout for establishing the tunnel connection to the dialer.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Optional address for the `/healthz` probe server.
    pub health_listen: Option<String>,
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
}

/// Leader election among agent replicas.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderElectionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Lease object name (the election name).
    #[serde(default = "default_election_id")]
    pub id: String,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_secs: u64,
    #[serde(default = "default_retry_period")]
    pub retry_period_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen() -> String {
    "0.0.0.0:80".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_register_timeout_ms() -> u64 {
    5000
}
fn default_register_check_interval_ms() -> u64 {
    1000
}
fn default_dial_timeout_secs() -> u64 {
    10
}
fn default_etcd_prefix() -> String {
    crate::directory::ETCD_KEY_PREFIX.to_string()
}
fn default_etcd_timeout() -> u64 {
    5
}
fn default_registry_timeout() -> u64 {
    10
}
fn default_access_key_secret() -> String {
    "erda-cluster-credential".to_string()
}
fn default_access_key_field() -> String {
    "CLUSTER_ACCESS_KEY".to_string()
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_service_account() -> String {
    "cluster-agent".to_string()
}
fn default_token_secret() -> String {
    "cluster-agent-token".to_string()
}
fn default_api_server() -> String {
    "https://kubernetes.default.svc:443".to_string()
}
fn default_retry_interval() -> u64 {
    2
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_election_id() -> String {
    "cluster-agent-leader".to_string()
}
fn default_lease_duration() -> u64 {
    15
}
fn default_renew_deadline() -> u64 {
    10
}
fn default_retry_period() -> u64 {
    2
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            need_cluster_info: true,
            timeout_secs: default_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            register_timeout_ms: default_register_timeout_ms(),
            register_check_interval_ms: default_register_check_interval_ms(),
            dial_timeout_secs: default_dial_timeout_secs(),
            insecure_skip_verify: true,
            advertise_ip: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            cluster_key: String::new(),
            client_type: String::new(),
            client_detail: None,
            collect_cluster_info: true,
            access_key: None,
            access_key_secret: default_access_key_secret(),
            access_key_field: default_access_key_field(),
            erda_namespace: default_namespace(),
            service_account: default_service_account(),
            token_secret_name: default_token_secret(),
            api_server_address: default_api_server(),
            retry_interval_secs: default_retry_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            dial_timeout_secs: default_dial_timeout_secs(),
            health_listen: None,
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            id: default_election_id(),
            lease_duration_secs: default_lease_duration(),
            renew_deadline_secs: default_renew_deadline(),
            retry_period_secs: default_retry_period(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `clusterdialer.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("clusterdialer.toml").exists() => {
                Self::from_file("clusterdialer.toml")?
            }
            None => Config::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply env-var overrides. `lookup` is injected so tests don't touch
    /// the process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("DIALER_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = lookup("NEED_CLUSTER_INFO") {
            self.server.need_cluster_info = parse_bool("NEED_CLUSTER_INFO", &v)?;
        }
        if let Some(v) = lookup("POD_IP") {
            self.server.advertise_ip.get_or_insert(v);
        }
        if let Some(v) = lookup("ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            match self.etcd.as_mut() {
                Some(etcd) => etcd.endpoints = endpoints,
                None => {
                    self.etcd = Some(EtcdConfig {
                        endpoints,
                        key_prefix: default_etcd_prefix(),
                        request_timeout_secs: default_etcd_timeout(),
                    });
                }
            }
        }
        if let Some(v) = lookup("CLUSTER_MANAGER_ADDR") {
            match self.cluster_registry.as_mut() {
                Some(reg) => reg.url = v,
                None => {
                    self.cluster_registry = Some(ClusterRegistryConfig {
                        url: v,
                        request_timeout_secs: default_registry_timeout(),
                    });
                }
            }
        }

        let agent = &mut self.agent;
        if let Some(v) = lookup("CLUSTER_DIALER_ENDPOINT") {
            agent.server_url = v;
        }
        if let Some(v) = lookup("CLUSTER_KEY") {
            agent.cluster_key = v;
        }
        if let Some(v) = lookup("CLIENT_TYPE") {
            agent.client_type = v;
        }
        if let Some(v) = lookup("CLUSTER_ACCESS_KEY") {
            if !v.is_empty() {
                agent.access_key = Some(v);
            }
        }
        if let Some(v) = lookup("ERDA_NAMESPACE") {
            agent.erda_namespace = v;
        }
        if let Some(v) = lookup("SERVICE_ACCOUNT") {
            agent.service_account = v;
        }
        if let Some(v) = lookup("TOKEN_SECRET_NAME") {
            agent.token_secret_name = v;
        }
        if let Some(v) = lookup("CLUSTER_API_SERVER") {
            agent.api_server_address = v;
        }
        if let Some(v) = lookup("LEADER_ELECTION") {
            agent.leader_election.enabled = parse_bool("LEADER_ELECTION", &v)?;
        }
        Ok(())
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}
