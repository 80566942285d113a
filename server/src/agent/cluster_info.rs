//! Collect the in-cluster API address and credentials reported at registration.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use super::secret::{Secret, SecretStore};
use super::AgentError;
use crate::config::AgentConfig;
use crate::tunnel::protocol::ClusterInfo;

pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

const TOKEN_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Read the service-account token secret, creating it first if needed.
///
/// A freshly created secret is filled in by the token controller, so the
/// read is retried with exponential backoff before giving up.
pub async fn collect_cluster_info(
    store: &dyn SecretStore,
    config: &AgentConfig,
) -> Result<ClusterInfo, AgentError> {
    let namespace = config.erda_namespace.as_str();
    let name = config.token_secret_name.as_str();

    if store.get(namespace, name).await?.is_none() {
        info!(secret = name, "creating service account token secret");
        store
            .create(
                namespace,
                Secret {
                    name: name.to_string(),
                    type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
                    annotations: BTreeMap::from([(
                        SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                        config.service_account.clone(),
                    )]),
                    data: BTreeMap::new(),
                },
            )
            .await?;
    }

    let mut delay = INITIAL_BACKOFF;
    for attempt in 1..=TOKEN_ATTEMPTS {
        match store.get(namespace, name).await {
            Ok(Some(secret)) => {
                if let Some(info) = cluster_info_from(&secret, &config.api_server_address) {
                    return Ok(info);
                }
                debug!(secret = name, attempt, "token not populated yet");
            }
            Ok(None) => debug!(secret = name, attempt, "token secret not found"),
            Err(e) => warn!(secret = name, attempt, "failed to read token secret: {e}"),
        }
        if attempt < TOKEN_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(AgentError::ClusterInfo(format!(
        "secret {namespace}/{name} has no token after {TOKEN_ATTEMPTS} attempts"
    )))
}

fn cluster_info_from(secret: &Secret, address: &str) -> Option<ClusterInfo> {
    let token = secret.string("token")?;
    let ca = secret.data.get("ca.crt").filter(|ca| !ca.is_empty())?;
    Some(ClusterInfo {
        address: address.to_string(),
        token,
        ca_cert: B64.encode(ca),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::secret::MemorySecretStore;
    use std::sync::Arc;

    fn token_secret(name: &str) -> Secret {
        Secret {
            name: name.into(),
            data: BTreeMap::from([
                ("token".to_string(), b"tok".to_vec()),
                ("ca.crt".to_string(), b"ca".to_vec()),
            ]),
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn reads_existing_token_secret() {
        let store = MemorySecretStore::default();
        let config = AgentConfig::default();
        store.put(&config.erda_namespace, token_secret(&config.token_secret_name));

        let info = collect_cluster_info(&store, &config).await.unwrap();
        assert_eq!(info.address, "https://kubernetes.default.svc:443");
        assert_eq!(info.token, "tok");
        assert_eq!(info.ca_cert, "Y2E=");
    }

    #[tokio::test(start_paused = true)]
    async fn creates_secret_and_waits_for_token() {
        let store = Arc::new(MemorySecretStore::default());
        let config = AgentConfig::default();

        let filler = {
            let (store, config) = (store.clone(), config.clone());
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                let created = store
                    .get(&config.erda_namespace, &config.token_secret_name)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(created.type_.as_deref(), Some(SERVICE_ACCOUNT_TOKEN_TYPE));
                assert_eq!(
                    created.annotations[SERVICE_ACCOUNT_NAME_ANNOTATION],
                    config.service_account
                );
                store.put(&config.erda_namespace, token_secret(&config.token_secret_name));
            })
        };

        let info = collect_cluster_info(store.as_ref(), &config).await.unwrap();
        assert_eq!(info.token, "tok");
        filler.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_backoff_budget() {
        let store = MemorySecretStore::default();
        let config = AgentConfig::default();
        let started = tokio::time::Instant::now();

        let err = collect_cluster_info(&store, &config).await.unwrap_err();
        assert!(matches!(err, AgentError::ClusterInfo(_)));
        // 1 + 2 + 4 + 8 seconds between five reads.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }
}
