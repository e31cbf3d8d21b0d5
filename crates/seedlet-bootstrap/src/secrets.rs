//! Kubeconfig secrets on the seed cluster

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

use crate::csr::{CsrApi, KubeCsrApi};
use crate::kubeconfig::{self, KUBECONFIG_KEY};
use seedlet_common::flow::ignore_not_found;
use seedlet_common::kube_utils::create_client_from_kubeconfig;
use seedlet_common::{Error, OPERATION_ANNOTATION, OPERATION_RENEW};

/// Seed-side secret access used while bootstrapping
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
    /// Store `kubeconfig`, creating the secret if needed and clearing any
    /// renew request
    async fn write_kubeconfig(
        &self,
        namespace: &str,
        name: &str,
        kubeconfig: &[u8],
    ) -> Result<(), Error>;
    /// Delete a secret; missing secrets are ignored
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`SecretStore`] backed by the seed client
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Wrap a seed client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn write_kubeconfig(
        &self,
        namespace: &str,
        name: &str,
        kubeconfig: &[u8],
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        if api.get_opt(name).await?.is_none() {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    KUBECONFIG_KEY.to_string(),
                    ByteString(kubeconfig.to_vec()),
                )])),
                ..Default::default()
            };
            api.create(&PostParams::default(), &secret).await?;
            return Ok(());
        }

        let patch = json!({
            "metadata": { "annotations": { OPERATION_ANNOTATION: null } },
            "data": { KUBECONFIG_KEY: STANDARD.encode(kubeconfig) },
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        ignore_not_found(
            self.api(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )
    }
}

/// Kubeconfig stored in `secret`, if any
pub fn secret_kubeconfig(secret: &Secret) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_KEY))
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
}

/// True if someone asked for the credential in `secret` to be renewed
pub fn renew_requested(secret: &Secret) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OPERATION_ANNOTATION))
        .is_some_and(|v| v == OPERATION_RENEW)
}

/// Opens garden API handles from a kubeconfig
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GardenConnector: Send + Sync {
    /// CSR access authenticated by `kubeconfig`
    async fn csr_api(&self, kubeconfig: &[u8]) -> Result<Arc<dyn CsrApi>, Error>;
}

/// [`GardenConnector`] creating real kube clients
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeGardenConnector;

#[async_trait]
impl GardenConnector for KubeGardenConnector {
    async fn csr_api(&self, kubeconfig: &[u8]) -> Result<Arc<dyn CsrApi>, Error> {
        let config = kubeconfig::parse(kubeconfig)?;
        let client = create_client_from_kubeconfig(config).await?;
        Ok(Arc::new(KubeCsrApi::new(client)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn kubeconfig_secret(kubeconfig: &[u8], annotations: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                KUBECONFIG_KEY.to_string(),
                ByteString(kubeconfig.to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn reads_kubeconfig_key() {
        let secret = kubeconfig_secret(b"cfg", &[]);
        assert_eq!(secret_kubeconfig(&secret), Some(b"cfg".to_vec()));
        assert_eq!(secret_kubeconfig(&Secret::default()), None);
        assert_eq!(secret_kubeconfig(&kubeconfig_secret(b"", &[])), None);
    }

    #[test]
    fn renew_annotation_must_say_renew() {
        let renew = kubeconfig_secret(b"cfg", &[(OPERATION_ANNOTATION, OPERATION_RENEW)]);
        assert!(renew_requested(&renew));
        let reconcile = kubeconfig_secret(b"cfg", &[(OPERATION_ANNOTATION, "reconcile")]);
        assert!(!renew_requested(&reconcile));

        assert!(!renew_requested(&Secret::default()));
    }
}
