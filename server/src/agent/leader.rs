//! Leader gate for agent replicas.
//!
//! Only the replica holding the lease runs the connector. Losing the lease
//! cancels the root token so everything shuts down in order, and `run`
//! reports [`AgentError::LeadershipLost`] so the process exits non-zero.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AgentError;
use crate::config::LeaderElectionConfig;

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("invalid lease: {0}")]
    InvalidLease(String),
    #[error("lease store unavailable")]
    Unavailable,
}

/// A distributed lease.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Take the lease if free or expired, or renew it if already ours.
    /// `Ok(false)` means someone else holds it.
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError>;

    /// Give the lease up if `identity` holds it.
    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError>;
}

/// Unique per process: hostname plus a random suffix.
pub fn election_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, identity: String, config: &LeaderElectionConfig) -> Self {
        Self {
            lock,
            identity,
            lease_duration: Duration::from_secs(config.lease_duration_secs),
            renew_deadline: Duration::from_secs(config.renew_deadline_secs),
            retry_period: Duration::from_secs(config.retry_period_secs.max(1)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until the lease is ours. `None` if cancelled first.
    pub async fn acquire(self: Arc<Self>, cancel: &CancellationToken) -> Option<LeaderGuard> {
        info!(identity = %self.identity, "waiting for leadership");
        loop {
            match self
                .lock
                .try_acquire_or_renew(&self.identity, self.lease_duration)
                .await
            {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return Some(self.guard());
                }
                Ok(false) => debug!(identity = %self.identity, "lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, "failed to acquire lease: {e}"),
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move { elector.renewal_loop(lost_tx).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Renew every retry period. Transient errors are tolerated until the
    /// renew deadline passes; a lease taken by someone else is lost at once.
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;
            match self
                .lock
                .try_acquire_or_renew(&self.identity, self.lease_duration)
                .await
            {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken by another replica");
                    break;
                }
                Err(e) if last_renewed.elapsed() < self.renew_deadline => {
                    warn!(identity = %self.identity, "lease renewal failed, retrying: {e}");
                }
                Err(e) => {
                    warn!(identity = %self.identity, "lease renewal deadline exceeded: {e}");
                    break;
                }
            }
        }
        let _ = lost_tx.send(());
    }
}

/// Held while this replica leads. Dropping it stops renewal.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves when leadership is lost.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Stop renewing and free the lease for fast failover.
    pub async fn release(self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.lock.release(&self.elector.identity).await?;
        info!(identity = %self.elector.identity, "lease released");
        Ok(())
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

/// Run `work` only while leading.
///
/// `work` gets a child of `cancel`. On lost leadership `cancel` itself is
/// cancelled, `work` is awaited to completion, and `LeadershipLost` is
/// returned. On normal completion the lease is released.
pub async fn run_with_leader_gate<F, Fut>(
    elector: Arc<LeaderElector>,
    cancel: CancellationToken,
    work: F,
) -> Result<(), AgentError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), AgentError>>,
{
    let Some(mut guard) = elector.acquire(&cancel).await else {
        return Ok(());
    };

    let work = work(cancel.child_token());
    tokio::pin!(work);

    tokio::select! {
        result = &mut work => {
            if let Err(e) = guard.release().await {
                warn!("failed to release lease: {e}");
            }
            result
        }
        () = guard.lost() => {
            error!("leadership lost, shutting down");
            cancel.cancel();
            if let Err(e) = work.await {
                warn!("connector exited with error after losing leadership: {e}");
            }
            Err(AgentError::LeadershipLost)
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryLease {
    holder: String,
    expires: Instant,
}

/// Process-local lease with the same expiry rules as the Kubernetes one.
#[derive(Default)]
pub struct MemoryLeaseLock {
    lease: Mutex<Option<MemoryLease>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryLeaseLock {
    fn lease(&self) -> std::sync::MutexGuard<'_, Option<MemoryLease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn holder(&self) -> Option<String> {
        self.lease()
            .as_ref()
            .filter(|l| l.expires > Instant::now())
            .map(|l| l.holder.clone())
    }

    /// Hand the lease to `identity` regardless of the current holder.
    pub fn steal(&self, identity: &str, duration: Duration) {
        *self.lease() = Some(MemoryLease {
            holder: identity.to_string(),
            expires: Instant::now() + duration,
        });
    }

    /// Make every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LeaderElectionError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LeaderElectionError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        self.check_available()?;
        let mut lease = self.lease();
        let now = Instant::now();
        let free = match lease.as_ref() {
            None => true,
            Some(l) => l.holder == identity || l.expires <= now,
        };
        if free {
            *lease = Some(MemoryLease {
                holder: identity.to_string(),
                expires: now + lease_duration,
            });
        }
        Ok(free)
    }

    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError> {
        self.check_available()?;
        let mut lease = self.lease();
        if lease.as_ref().is_some_and(|l| l.holder == identity) {
            *lease = None;
        }
        Ok(())
    }
}
