//! The rotating access key and the watcher that keeps it current.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::secret::{SecretEvent, SecretStore};
use crate::tunnel::client::ConnectionControl;

/// Holder of the single current access key.
///
/// Readers always see the newest value; `set` reports whether the value
/// actually changed so rotation only triggers on real changes.
#[derive(Clone)]
pub struct CredentialSource {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for CredentialSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialSource {
    /// Empty source, filled in later by [`watch_credentials`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Source pinned to a static key.
    pub fn fixed(key: impl Into<String>) -> Self {
        let source = Self::new();
        source.set(key.into());
        source
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Store `key`. Returns `true` when it differs from the held value.
    pub fn set(&self, key: String) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(key.as_str()) {
                false
            } else {
                *current = Some(key);
                true
            }
        })
    }

    /// Wait until a key is known. `None` if cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Option<String> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            () = cancel.cancelled() => None,
            key = rx.wait_for(Option::is_some) => key.ok().and_then(|k| k.clone()),
        }
    }
}

/// Where the rotating key lives.
#[derive(Debug, Clone)]
pub struct CredentialRef {
    pub namespace: String,
    pub secret: String,
    pub field: String,
}

/// Follow the credential secret until `cancel` fires.
///
/// Deletions are ignored so a live session stays up. A change to a new key
/// while connected asks the connector to reconnect with it. A failed or
/// ended watch is re-established after a short random delay.
pub async fn watch_credentials(
    store: Arc<dyn SecretStore>,
    target: CredentialRef,
    credentials: CredentialSource,
    control: ConnectionControl,
    cancel: CancellationToken,
) {
    loop {
        match store.watch(&target.namespace, &target.secret).await {
            Ok(mut events) => {
                info!(secret = %target.secret, "watching access key secret");
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => return,
                        event = events.next() => event,
                    };
                    let Some(event) = event else {
                        warn!(secret = %target.secret, "access key watch ended");
                        break;
                    };
                    apply_event(event, &target, &credentials, &control);
                }
            }
            Err(e) => warn!(secret = %target.secret, "failed to watch access key secret: {e}"),
        }

        let backoff = Duration::from_millis(rand::rng().random_range(1000..=5000));
        debug!("re-watching access key secret in {}ms", backoff.as_millis());
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
    }
}

fn apply_event(
    event: SecretEvent,
    target: &CredentialRef,
    credentials: &CredentialSource,
    control: &ConnectionControl,
) {
    let secret = match event {
        SecretEvent::Applied(secret) => secret,
        SecretEvent::Deleted(name) => {
            debug!(secret = %name, "access key secret deleted, keeping current key");
            return;
        }
    };
    let Some(key) = secret.string(&target.field) else {
        warn!(
            secret = %secret.name,
            field = %target.field,
            "access key field missing, keeping current key"
        );
        return;
    };
    if !credentials.set(key) {
        return;
    }
    if control.is_connected() {
        info!("access key rotated, reconnecting");
        control.request_disconnect();
    } else {
        info!("access key updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::secret::{MemorySecretStore, Secret};
    use crate::tunnel::client::ConnectorState;

    fn cred_secret(value: &str) -> Secret {
        Secret {
            name: "cred".into(),
            data: [("CLUSTER_ACCESS_KEY".to_string(), value.as_bytes().to_vec())].into(),
            ..Secret::default()
        }
    }

    fn target() -> CredentialRef {
        CredentialRef {
            namespace: "ns".into(),
            secret: "cred".into(),
            field: "CLUSTER_ACCESS_KEY".into(),
        }
    }

    #[test]
    fn set_reports_changes_only() {
        let source = CredentialSource::new();
        assert!(source.current().is_none());
        assert!(source.set("k1".into()));
        assert!(!source.set("k1".into()));
        assert!(source.set("k2".into()));
        assert_eq!(source.current().as_deref(), Some("k2"));
        assert_eq!(CredentialSource::fixed("s").current().as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn wait_ready_blocks_until_set_or_cancel() {
        let source = CredentialSource::new();
        let cancel = CancellationToken::new();
        let waiter = {
            let (source, cancel) = (source.clone(), cancel.clone());
            tokio::spawn(async move { source.wait_ready(&cancel).await })
        };
        tokio::task::yield_now().await;
        source.set("k1".into());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("k1"));

        let empty = CredentialSource::new();
        cancel.cancel();
        assert!(empty.wait_ready(&cancel).await.is_none());
    }

    #[test]
    fn events_rotate_and_request_disconnect_when_connected() {
        let credentials = CredentialSource::fixed("k1");
        let control = ConnectionControl::new();
        control.set_state(ConnectorState::Connected);

        apply_event(SecretEvent::Applied(cred_secret("k1")), &target(), &credentials, &control);
        assert!(!control.take_disconnect_request());

        apply_event(SecretEvent::Applied(cred_secret("k2")), &target(), &credentials, &control);
        assert_eq!(credentials.current().as_deref(), Some("k2"));
        assert!(control.take_disconnect_request());
    }

    #[test]
    fn delete_and_missing_field_keep_current_key() {
        let credentials = CredentialSource::fixed("k1");
        let control = ConnectionControl::new();
        control.set_state(ConnectorState::Connected);

        apply_event(SecretEvent::Deleted("cred".into()), &target(), &credentials, &control);
        apply_event(
            SecretEvent::Applied(Secret {
                name: "cred".into(),
                ..Secret::default()
            }),
            &target(),
            &credentials,
            &control,
        );
        assert_eq!(credentials.current().as_deref(), Some("k1"));
        assert!(!control.take_disconnect_request());
    }

    #[tokio::test]
    async fn watcher_picks_up_initial_and_rotated_keys() {
        let store = Arc::new(MemorySecretStore::default());
        store.put("ns", cred_secret("k1"));
        let credentials = CredentialSource::new();
        let control = ConnectionControl::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(watch_credentials(
            store.clone(),
            target(),
            credentials.clone(),
            control.clone(),
            cancel.clone(),
        ));
        assert_eq!(credentials.wait_ready(&cancel).await.as_deref(), Some("k1"));

        let mut rx = credentials.tx.subscribe();
        store.put("ns", cred_secret("k2"));
        rx.wait_for(|k| k.as_deref() == Some("k2")).await.unwrap();

        cancel.cancel();
        task.await.unwrap();
    }
}
