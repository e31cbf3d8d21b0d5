//! Removal of bootstrap authentication once a certificate was issued

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams};
use kube::Client;
use tracing::info;

use seedlet_common::flow::ignore_not_found;
use seedlet_common::Error;

const BOOTSTRAP_USER_PREFIX: &str = "system:bootstrap:";
const SERVICE_ACCOUNT_USER_PREFIX: &str = "system:serviceaccount:";
const BOOTSTRAP_TOKEN_NAMESPACE: &str = "kube-system";
const BOOTSTRAP_TOKEN_SECRET_PREFIX: &str = "bootstrap-token-";
const BOOTSTRAPPER_BINDING_PREFIX: &str = "seedlet:system:seed-bootstrapper:";

/// Who sent a CSR during bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPrincipal {
    /// Kubernetes bootstrap token with the given token id
    Token {
        /// Token id (first half of the token)
        id: String,
    },
    /// Service account that was bound to the bootstrapper role
    ServiceAccount {
        /// Namespace of the service account
        namespace: String,
        /// Name of the service account
        name: String,
    },
}

impl BootstrapPrincipal {
    /// Principal behind an authenticated username, if it is a bootstrap one
    pub fn from_username(username: &str) -> Option<Self> {
        if let Some(id) = username.strip_prefix(BOOTSTRAP_USER_PREFIX) {
            return (!id.is_empty()).then(|| Self::Token { id: id.to_string() });
        }
        let rest = username.strip_prefix(SERVICE_ACCOUNT_USER_PREFIX)?;
        let (namespace, name) = rest.split_once(':')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::ServiceAccount {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Garden access needed for cleanup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BootstrapAuthApi: Send + Sync {
    /// Username that created the CSR, if the CSR still exists
    async fn csr_username(&self, csr_name: &str) -> Result<Option<String>, Error>;
    /// Delete the CSR
    async fn delete_csr(&self, csr_name: &str) -> Result<(), Error>;
    /// Delete a secret
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
    /// Delete a service account
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error>;
    /// Delete a cluster role binding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;
}

/// [`BootstrapAuthApi`] backed by a garden client; deletes ignore not-found
pub struct KubeBootstrapAuthApi {
    client: Client,
}

impl KubeBootstrapAuthApi {
    /// Wrap a garden client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn delete_ignoring_missing<K>(api: Api<K>, name: &str) -> Result<(), Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    ignore_not_found(
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(Error::from),
    )
}

#[async_trait]
impl BootstrapAuthApi for KubeBootstrapAuthApi {
    async fn csr_username(&self, csr_name: &str) -> Result<Option<String>, Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api
            .get_opt(csr_name)
            .await?
            .and_then(|csr| csr.spec.username))
    }

    async fn delete_csr(&self, csr_name: &str) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        delete_ignoring_missing(api, csr_name).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        delete_ignoring_missing(api, name).await
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        delete_ignoring_missing(api, name).await
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        delete_ignoring_missing::<ClusterRoleBinding>(Api::all(self.client.clone()), name).await
    }
}

/// Delete whatever authenticated the bootstrap CSR, then the CSR itself
///
/// A CSR that is already gone leaves nothing to trace back, so it is not an
/// error.
pub async fn delete_bootstrap_auth(
    api: &dyn BootstrapAuthApi,
    csr_name: &str,
) -> Result<(), Error> {
    let Some(username) = api.csr_username(csr_name).await? else {
        info!(csr = %csr_name, "CSR already gone, nothing to clean up");
        return Ok(());
    };

    match BootstrapPrincipal::from_username(&username) {
        Some(BootstrapPrincipal::Token { id }) => {
            let secret = format!("{BOOTSTRAP_TOKEN_SECRET_PREFIX}{id}");
            api.delete_secret(BOOTSTRAP_TOKEN_NAMESPACE, &secret).await?;
            info!(secret = %secret, "Deleted bootstrap token");
        }
        Some(BootstrapPrincipal::ServiceAccount { namespace, name }) => {
            api.delete_service_account(&namespace, &name).await?;
            let binding = format!("{BOOTSTRAPPER_BINDING_PREFIX}{namespace}:{name}");
            api.delete_cluster_role_binding(&binding).await?;
            info!(
                service_account = %format!("{namespace}/{name}"),
                "Deleted bootstrap service account"
            );
        }
        None => {
            info!(csr = %csr_name, user = %username, "CSR not created by a bootstrap principal")
        }
    }

    api.delete_csr(csr_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("system:bootstrap:abcdef", Some(BootstrapPrincipal::Token { id: "abcdef".into() }))]
    #[case(
        "system:serviceaccount:garden:seed-bootstrap",
        Some(BootstrapPrincipal::ServiceAccount {
            namespace: "garden".into(),
            name: "seed-bootstrap".into(),
        })
    )]
    #[case("system:bootstrap:", None)]
    #[case("system:serviceaccount:garden", None)]
    #[case("seedlet:system:seed:aws-eu1", None)]
    fn parses_bootstrap_principals(
        #[case] user: &str,
        #[case] expected: Option<BootstrapPrincipal>,
    ) {
        assert_eq!(BootstrapPrincipal::from_username(user), expected);
    }

    #[tokio::test]
    async fn token_bootstrap_deletes_token_secret_and_csr() {
        let mut api = MockBootstrapAuthApi::new();
        api.expect_csr_username()
            .returning(|_| Ok(Some("system:bootstrap:abcdef".to_string())));
        api.expect_delete_secret()
            .withf(|ns, name| {
                ns.to_string() == "kube-system" && name.to_string() == "bootstrap-token-abcdef"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_delete_csr()
            .withf(|name| name.to_string() == "seed-csr-1")
            .times(1)
            .returning(|_| Ok(()));

        delete_bootstrap_auth(&api, "seed-csr-1").await.unwrap();
    }

    #[tokio::test]
    async fn service_account_bootstrap_deletes_account_and_binding() {
        let mut api = MockBootstrapAuthApi::new();
        api.expect_csr_username()
            .returning(|_| Ok(Some("system:serviceaccount:garden:seed-bootstrap".to_string())));
        api.expect_delete_service_account()
            .withf(|ns, name| ns.to_string() == "garden" && name.to_string() == "seed-bootstrap")
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_delete_cluster_role_binding()
            .withf(|name| {
                name.to_string() == "seedlet:system:seed-bootstrapper:garden:seed-bootstrap"
            })

            .times(1)
            .returning(|_| Ok(()));
        api.expect_delete_csr().times(1).returning(|_| Ok(()));

        delete_bootstrap_auth(&api, "seed-csr-1").await.unwrap();
    }

    #[tokio::test]
    async fn missing_csr_is_a_no_op() {
        let mut api = MockBootstrapAuthApi::new();
        api.expect_csr_username().returning(|_| Ok(None));
        api.expect_delete_csr().never();

        delete_bootstrap_auth(&api, "seed-csr-1").await.unwrap();
    }

    #[tokio::test]
    async fn delete_failures_propagate() {
        let mut api = MockBootstrapAuthApi::new();
        api.expect_csr_username()
            .returning(|_| Ok(Some("system:bootstrap:abcdef".to_string())));
        api.expect_delete_secret()
            .returning(|_, _| Err(seedlet_common::error::api_error(500, "InternalError").into()));
        api.expect_delete_csr().never();

        assert!(delete_bootstrap_auth(&api, "seed-csr-1").await.is_err());
    }
}
