//! Live tunnel sessions indexed by cluster key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::DuplexStream;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use super::mux::{DialError, Mux};

/// One authenticated agent connection.
pub struct Session {
    /// Distinguishes a replaced session from its successor under the same key.
    pub id: u64,
    pub cluster_key: String,
    mux: Arc<Mux>,
    /// When this session connected.
    pub connected_since: Instant,
    /// Last heartbeat timestamp as ms since registry epoch (lock-free).
    pub last_heartbeat_ms: AtomicU64,
    dial_timeout: Duration,
}

impl Session {
    /// Open a logical connection to `address` inside the agent's network.
    pub async fn dial(&self, proto: &str, address: &str) -> Result<DuplexStream, DialError> {
        self.mux.dial(proto, address, self.dial_timeout).await
    }

    pub fn mux(&self) -> &Arc<Mux> {
        &self.mux
    }
}

/// Introspection row for `GET /clusteragent/sessions`.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub cluster_key: String,
    pub connected_since_ms: u64,
    pub last_heartbeat_ago_ms: u64,
    pub open_streams: usize,
}

/// Session index shared by all dialer handlers.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    next_id: Arc<AtomicU64>,
    dial_timeout: Duration,
    /// Process epoch for lock-free heartbeat timestamps.
    epoch: Instant,
}

impl SessionRegistry {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            dial_timeout,
            epoch: Instant::now(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn has_session(&self, cluster_key: &str) -> bool {
        self.sessions.read().await.contains_key(cluster_key)
    }

    pub async fn get(&self, cluster_key: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(cluster_key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Index a new session. An existing session for the key is shut down
    /// and replaced.
    pub async fn register(&self, cluster_key: &str, mux: Arc<Mux>) -> Arc<Session> {
        let session = Arc::new(Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cluster_key: cluster_key.to_string(),
            mux,
            connected_since: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(self.now_ms()),
            dial_timeout: self.dial_timeout,
        });

        let old = self
            .sessions
            .write()
            .await
            .insert(cluster_key.to_string(), Arc::clone(&session));
        if let Some(old) = old {
            warn!(cluster_key, "session re-registering while stale connection exists, evicting old");
            old.mux.shutdown().await;
        }
        info!(cluster_key, "session registered");
        session
    }

    /// Remove `session` unless it has already been replaced.
    pub async fn remove(&self, session: &Session) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&session.cluster_key)
            .is_some_and(|s| s.id == session.id)
        {
            sessions.remove(&session.cluster_key);
            info!(cluster_key = %session.cluster_key, "session removed");
        }
    }

    /// Record a heartbeat.
    pub fn touch(&self, session: &Session) {
        session.last_heartbeat_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Evict sessions whose heartbeat is older than `timeout`. Returns the
    /// evicted keys.
    pub async fn sweep(&self, timeout: Duration) -> Vec<String> {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        let now_ms = self.now_ms();

        let mut sessions = self.sessions.write().await;
        let dead: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                now_ms.saturating_sub(s.last_heartbeat_ms.load(Ordering::Relaxed)) > timeout_ms
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            if let Some(session) = sessions.remove(key) {
                session.mux.shutdown().await;
                warn!(cluster_key = %key, "evicted session (heartbeat timeout)");
            }
        }
        dead
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let now_ms = self.now_ms();
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for s in sessions {
            #[allow(clippy::cast_possible_truncation)]
            let connected_ms = s.connected_since.elapsed().as_millis() as u64;
            out.push(SessionSummary {
                cluster_key: s.cluster_key.clone(),
                connected_since_ms: connected_ms,
                last_heartbeat_ago_ms: now_ms
                    .saturating_sub(s.last_heartbeat_ms.load(Ordering::Relaxed)),
                open_streams: s.mux.stream_count().await,
            });
        }
        out.sort_by(|a, b| a.cluster_key.cmp(&b.cluster_key));
        out
    }

    /// Shut down every session (dialer shutdown).
    pub async fn drain_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (key, session) in sessions.drain() {
            session.mux.shutdown().await;
            info!(cluster_key = %key, "drained session for shutdown");
        }
    }
}
