//! Secret access for the agent: the rotating credential and the
//! service-account token both live in namespaced secrets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("secret watch unavailable: {0}")]
    Watch(String),
}

/// The parts of a secret the agent cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub type_: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// UTF-8 value of `key`, trimmed. `None` when absent or empty.
    pub fn string(&self, key: &str) -> Option<String> {
        let value = self.data.get(key)?;
        let s = String::from_utf8_lossy(value).trim().to_string();
        (!s.is_empty()).then_some(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretEvent {
    /// Created, modified, or listed on (re)connect.
    Applied(Secret),
    Deleted(String),
}

pub type SecretEvents = BoxStream<'static, SecretEvent>;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretStoreError>;
    /// Create `secret`; an already existing secret is not an error.
    async fn create(&self, namespace: &str, secret: Secret) -> Result<(), SecretStoreError>;
    /// Stream changes to one secret. The current value, if any, comes first.
    /// The stream ends when the watch breaks.
    async fn watch(&self, namespace: &str, name: &str) -> Result<SecretEvents, SecretStoreError>;
}

/// Process-local secret store with change notification.
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<(String, String), Secret>>,
    events: broadcast::Sender<(String, SecretEvent)>,
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            secrets: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl MemorySecretStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Secret>> {
        self.secrets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or replace a secret and notify watchers.
    pub fn put(&self, namespace: &str, secret: Secret) {
        self.lock()
            .insert((namespace.to_string(), secret.name.clone()), secret.clone());
        let _ = self
            .events
            .send((namespace.to_string(), SecretEvent::Applied(secret)));
    }

    pub fn delete(&self, namespace: &str, name: &str) {
        self.lock().remove(&(namespace.to_string(), name.to_string()));
        let _ = self
            .events
            .send((namespace.to_string(), SecretEvent::Deleted(name.to_string())));
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretStoreError> {
        Ok(self
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, namespace: &str, secret: Secret) -> Result<(), SecretStoreError> {
        let exists = self
            .lock()
            .contains_key(&(namespace.to_string(), secret.name.clone()));
        if !exists {
            self.put(namespace, secret);
        }
        Ok(())
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<SecretEvents, SecretStoreError> {
        // Subscribe before reading so no change slips between the two.
        let rx = self.events.subscribe();
        let initial = self.get(namespace, name).await?.map(SecretEvent::Applied);

        let namespace = namespace.to_string();
        let name = name.to_string();
        let changes = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter_map(move |(ns, event)| {
            let relevant = ns == namespace
                && match &event {
                    SecretEvent::Applied(s) => s.name == name,
                    SecretEvent::Deleted(n) => *n == name,
                };
            futures::future::ready(relevant.then_some(event))
        });

        Ok(stream::iter(initial).chain(changes).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str, key: &str, value: &str) -> Secret {
        Secret {
            name: name.into(),
            data: [(key.to_string(), value.as_bytes().to_vec())].into(),
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn watch_yields_current_then_changes_for_one_secret() {
        let store = MemorySecretStore::default();
        store.put("ns", secret("cred", "k", "v1"));
        let mut events = store.watch("ns", "cred").await.unwrap();

        store.put("ns", secret("other", "k", "x"));
        store.put("other-ns", secret("cred", "k", "x"));
        store.put("ns", secret("cred", "k", "v2"));
        store.delete("ns", "cred");

        let values: Vec<SecretEvent> = events.by_ref().take(3).collect().await;
        assert_eq!(values[0], SecretEvent::Applied(secret("cred", "k", "v1")));
        assert_eq!(values[1], SecretEvent::Applied(secret("cred", "k", "v2")));
        assert_eq!(values[2], SecretEvent::Deleted("cred".into()));
    }

    #[tokio::test]
    async fn create_keeps_existing() {
        let store = MemorySecretStore::default();
        store.put("ns", secret("s", "k", "keep"));
        store.create("ns", secret("s", "k", "new")).await.unwrap();
        let s = store.get("ns", "s").await.unwrap().unwrap();
        assert_eq!(s.string("k").as_deref(), Some("keep"));
        assert_eq!(s.string("missing"), None);
    }
}
