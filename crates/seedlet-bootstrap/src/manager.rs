//! Garden kubeconfig bootstrap
//!
//! Resolution order:
//! 1. a kubeconfig file configured for the garden connection is used as-is
//! 2. a kubeconfig secret with an unexpired client certificate is reused,
//!    unless it carries the renew annotation
//! 3. otherwise a CSR is sent using the bootstrap kubeconfig (or the still
//!    valid current one when renewing) and the result is stored in the
//!    kubeconfig secret; the bootstrap secret is then deleted

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::csr::{default_poll, request_certificate, IssuedCertificate};
use crate::kubeconfig;
use crate::pki::CertificateInfo;
use crate::secrets::{renew_requested, secret_kubeconfig, GardenConnector, SecretStore};
use crate::{BootstrapResult, GardenCredential};
use seedlet_common::config::SeedletConfiguration;
use seedlet_common::crd::SecretReference;
use seedlet_common::metrics::CERTIFICATE_EXPIRY;
use seedlet_common::retry::RetryConfig;
use seedlet_common::Error;

/// Validity of the client certificate inside a kubeconfig
pub fn client_certificate_info(kubeconfig_data: &[u8]) -> Result<Option<CertificateInfo>, Error> {
    let config = kubeconfig::parse(kubeconfig_data)?;
    kubeconfig::client_certificate(&config)?
        .map(|pem| CertificateInfo::from_pem(&pem).map_err(Error::from))
        .transpose()
}

/// Publish time-to-expiry of the current certificate
pub(crate) fn record_expiry(info: &CertificateInfo, now: DateTime<Utc>) {
    CERTIFICATE_EXPIRY.record((info.not_after - now).num_seconds() as f64, &[]);
}

/// Request a certificate authenticated by `auth_kubeconfig` and render the
/// kubeconfig that uses it
pub async fn issue_kubeconfig(
    connector: &dyn GardenConnector,
    auth_kubeconfig: &[u8],
    seed_name: &str,
    validity: Option<Duration>,
    poll: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(Vec<u8>, IssuedCertificate), Error> {
    let endpoint = kubeconfig::endpoint(&kubeconfig::parse(auth_kubeconfig)?)?;
    let api = connector.csr_api(auth_kubeconfig).await?;
    let issued = request_certificate(api.as_ref(), seed_name, validity, poll, cancel).await?;
    let rendered = kubeconfig::render(&endpoint, &issued.cert_pem, &issued.key_pem)?;
    Ok((rendered, issued))
}

/// Bootstrap runnable producing the garden credential
pub struct GardenKubeconfigBootstrapper {
    seed_name: String,
    kubeconfig_path: Option<PathBuf>,
    kubeconfig_secret: Option<SecretReference>,
    bootstrap_secret: Option<SecretReference>,
    validity: Option<Duration>,
    secrets: Arc<dyn SecretStore>,
    connector: Arc<dyn GardenConnector>,
    result: BootstrapResult,
    poll: RetryConfig,
}

impl GardenKubeconfigBootstrapper {
    /// Bootstrapper for the configured seed, publishing into `result`
    pub fn new(
        config: &SeedletConfiguration,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn GardenConnector>,
        result: BootstrapResult,
    ) -> Self {
        let garden = &config.garden_client_connection;
        Self {
            seed_name: config.seed_name().to_string(),
            kubeconfig_path: garden.kubeconfig.clone(),
            kubeconfig_secret: garden.kubeconfig_secret.clone(),
            bootstrap_secret: garden.bootstrap_kubeconfig.clone(),
            validity: garden.kubeconfig_validity.validity(),
            secrets,
            connector,
            result,
            poll: default_poll(),
        }
    }

    /// Override how long pending CSRs are polled
    pub fn with_poll(mut self, poll: RetryConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Resolve the credential and publish it
    ///
    /// Running again while the published credential is still the valid one
    /// changes nothing.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let credential = self.resolve(cancel).await?;
        match self.result.get() {
            Some(published) if published.kubeconfig == credential.kubeconfig => {
                debug!("Garden credential already published");
                Ok(())
            }
            _ => self.result.set(credential),
        }
    }

    async fn resolve(&self, cancel: &CancellationToken) -> Result<GardenCredential, Error> {
        if let Some(path) = &self.kubeconfig_path {
            let data = tokio::fs::read(path).await.map_err(|e| {
                Error::config(
                    "gardenClientConnection.kubeconfig",
                    format!("failed to read {}: {e}", path.display()),
                )
            })?;
            info!(path = %path.display(), "Using garden kubeconfig file");
            return Ok(GardenCredential::existing(data));
        }

        let target = self.kubeconfig_secret.as_ref().ok_or_else(|| {
            Error::config(
                "gardenClientConnection.kubeconfigSecret",
                "neither a kubeconfig file nor a kubeconfig secret is configured",
            )
        })?;

        let mut renew_with = None;
        if let Some(secret) = self.secrets.get(&target.namespace, &target.name).await? {
            if let Some(current) = secret_kubeconfig(&secret) {
                match self.usable_certificate(&current) {
                    Some(info) if !renew_requested(&secret) => {
                        record_expiry(&info, Utc::now());
                        info!(
                            secret = %format!("{}/{}", target.namespace, target.name),
                            not_after = %info.not_after,
                            "Reusing existing garden kubeconfig"
                        );
                        return Ok(GardenCredential::existing(current));
                    }
                    Some(_) => {
                        info!("Renewal requested for garden kubeconfig");
                        renew_with = Some(current);
                    }
                    None => info!("Existing garden kubeconfig is expired or unreadable"),
                }
            }
        }

        let (auth, from_bootstrap_secret) = match renew_with {
            Some(current) => (current, false),
            None => (self.bootstrap_kubeconfig().await?, true),
        };

        let (rendered, issued) = issue_kubeconfig(
            self.connector.as_ref(),
            &auth,
            &self.seed_name,
            self.validity,
            &self.poll,
            cancel,
        )
        .await?;

        self.secrets
            .write_kubeconfig(&target.namespace, &target.name, &rendered)
            .await?;
        info!(
            secret = %format!("{}/{}", target.namespace, target.name),
            csr = %issued.csr_name,
            "Stored garden kubeconfig"
        );

        if from_bootstrap_secret {
            if let Some(bootstrap) = &self.bootstrap_secret {
                self.secrets
                    .delete(&bootstrap.namespace, &bootstrap.name)
                    .await?;
                info!(
                    secret = %format!("{}/{}", bootstrap.namespace, bootstrap.name),
                    "Deleted bootstrap kubeconfig secret"
                );
            }
        }

        Ok(GardenCredential {
            kubeconfig: rendered,
            csr_name: Some(issued.csr_name),
            seed_name: Some(self.seed_name.clone()),
        })
    }

    fn usable_certificate(&self, kubeconfig_data: &[u8]) -> Option<CertificateInfo> {
        match client_certificate_info(kubeconfig_data) {
            Ok(Some(info)) if !info.is_expired_at(Utc::now()) => Some(info),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Cannot inspect existing garden kubeconfig");
                None
            }
        }
    }

    async fn bootstrap_kubeconfig(&self) -> Result<Vec<u8>, Error> {
        let bootstrap = self.bootstrap_secret.as_ref().ok_or_else(|| {
            Error::config(
                "gardenClientConnection.bootstrapKubeconfig",
                "no usable garden kubeconfig and no bootstrap kubeconfig configured",
            )
        })?;
        self.secrets
            .get(&bootstrap.namespace, &bootstrap.name)
            .await?
            .as_ref()
            .and_then(secret_kubeconfig)
            .ok_or_else(|| {
                Error::bootstrap_permanent(
                    "bootstrap",
                    format!(
                        "bootstrap kubeconfig secret {}/{} is missing or empty",
                        bootstrap.namespace, bootstrap.name
                    ),
                )
            })
    }
}
