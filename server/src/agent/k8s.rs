//! Kubernetes-backed secret store and lease lock.
//!
//! # Atomicity
//!
//! The lease is updated with its `resourceVersion`, so a write racing
//! another replica fails with 409 Conflict instead of silently winning.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{future, StreamExt};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Secret as KubeSecret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::leader::{LeaderElectionError, LeaseLock};
use super::secret::{Secret, SecretEvent, SecretEvents, SecretStore, SecretStoreError};

const FIELD_MANAGER: &str = "clusterdialer-agent";

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == code)
}

fn from_kube(secret: KubeSecret) -> Secret {
    Secret {
        name: secret.name_any(),
        type_: secret.type_,
        annotations: secret.metadata.annotations.unwrap_or_default(),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect(),
    }
}

fn to_kube(namespace: &str, secret: Secret) -> KubeSecret {
    KubeSecret {
        metadata: ObjectMeta {
            name: Some(secret.name),
            namespace: Some(namespace.to_string()),
            annotations: (!secret.annotations.is_empty()).then_some(secret.annotations),
            ..Default::default()
        },
        type_: secret.type_,
        data: (!secret.data.is_empty()).then(|| {
            secret
                .data
                .into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect::<BTreeMap<_, _>>()
        }),
        ..Default::default()
    }
}

pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretStoreError> {
        let api: Api<KubeSecret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(from_kube))
    }

    async fn create(&self, namespace: &str, secret: Secret) -> Result<(), SecretStoreError> {
        let api: Api<KubeSecret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.name.clone();
        match api.create(&PostParams::default(), &to_kube(namespace, secret)).await {
            Ok(_) => {
                info!(secret = %name, "secret created");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => {
                debug!(secret = %name, "secret already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<SecretEvents, SecretStoreError> {
        let api: Api<KubeSecret> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

        // The watcher yields errors and keeps going; end the stream on the
        // first one so the caller re-establishes the watch after a backoff.
        let events = watcher::watcher(api, config)
            .take_while(|res| {
                if let Err(e) = res {
                    warn!("secret watch failed: {e}");
                }
                future::ready(res.is_ok())
            })
            .filter_map(|res| {
                future::ready(match res {
                    Ok(Event::Apply(secret) | Event::InitApply(secret)) => {
                        Some(SecretEvent::Applied(from_kube(secret)))
                    }
                    Ok(Event::Delete(secret)) => Some(SecretEvent::Deleted(secret.name_any())),
                    _ => None,
                })
            })
            .boxed();
        Ok(events)
    }
}

/// `coordination.k8s.io/v1` Lease used as the agents' election lock.
pub struct KubeLeaseLock {
    client: Client,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn spec(identity: &str, lease_duration: Duration, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(i32::try_from(lease_duration.as_secs()).unwrap_or(i32::MAX)),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Replace the lease under its resourceVersion. A conflict means
    /// someone else wrote it first.
    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self.api().replace(&self.name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 409) => {
                debug!(lease = %self.name, "lease update conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let Some(existing) = api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(Self::spec(identity, lease_duration, 0)),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(lease = %self.name, identity, "lease created");
                    Ok(true)
                }
                Err(e) if is_status(&e, 409) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        if existing.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::InvalidLease(format!(
                "{} has no resourceVersion",
                self.name
            )));
        }
        let spec = existing.spec.clone().unwrap_or_default();

        if spec.holder_identity.as_deref() == Some(identity) {
            let mut renewed = existing;
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(Utc::now()));
            }
            return self.replace(&renewed).await;
        }

        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(renewed), Some(secs)) => {
                Utc::now() > renewed.0 + chrono::Duration::seconds(i64::from(secs))
            }
            _ => true,
        };
        // A released lease has no holder and can be taken immediately.
        if !expired && spec.holder_identity.is_some() {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let taken = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: existing.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(Self::spec(identity, lease_duration, transitions)),
        };
        let acquired = self.replace(&taken).await?;
        if acquired {
            info!(lease = %self.name, identity, transitions, "took over lease");
        }
        Ok(acquired)
    }

    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError> {
        let api = self.api();
        let Some(lease) = api.get_opt(&self.name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(identity) {
            debug!(lease = %self.name, "not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            }
        });
        api.patch(&self.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
