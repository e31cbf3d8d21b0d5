//! Certificate-signing-request handshake against the garden

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pki::SeedCertRequest;
use seedlet_common::kube_utils::deterministic_hash;
use seedlet_common::metrics::record_csr;
use seedlet_common::retry::{retry_with_backoff, RetryConfig};
use seedlet_common::Error;

/// Signer for client certificates accepted by the garden API server
pub const CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Prefix of CSR names created by seed agents
pub const CSR_NAME_PREFIX: &str = "seed-csr-";

/// CSR access in the garden
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CsrApi: Send + Sync {
    /// Create the request; an existing request of the same name is kept
    async fn create(&self, csr: &CertificateSigningRequest) -> Result<(), Error>;
    /// Fetch a request by name
    async fn get(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error>;
    /// Delete a request; missing requests are ignored
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// [`CsrApi`] backed by a garden client
pub struct KubeCsrApi {
    client: Client,
}

impl KubeCsrApi {
    /// Wrap a garden client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl CsrApi for KubeCsrApi {
    async fn create(&self, csr: &CertificateSigningRequest) -> Result<(), Error> {
        match self.api().create(&PostParams::default(), csr).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error> {
        Ok(self.api().get_opt(name).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        seedlet_common::flow::ignore_not_found(
            self.api()
                .delete(name, &Default::default())
                .await
                .map(|_| ())
                .map_err(Error::from),
        )
    }
}

/// Where a request stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrState {
    /// Not yet approved, or approved but not yet signed
    Pending,
    /// Signed; carries the PEM certificate
    Issued(Vec<u8>),
    /// Rejected by an approver
    Denied(String),
    /// The signer gave up
    Failed(String),
}

/// Classify a request by its status conditions and certificate
pub fn csr_state(csr: &CertificateSigningRequest) -> CsrState {
    let Some(status) = csr.status.as_ref() else {
        return CsrState::Pending;
    };
    for condition in status.conditions.iter().flatten() {
        let message = condition.message.clone().unwrap_or_default();
        match condition.type_.as_str() {
            "Denied" => return CsrState::Denied(message),
            "Failed" => return CsrState::Failed(message),
            _ => {}
        }
    }
    match &status.certificate {
        Some(cert) if !cert.0.is_empty() => CsrState::Issued(cert.0.clone()),
        _ => CsrState::Pending,
    }
}

/// Deterministic CSR object name for a PEM request
pub fn csr_name(csr_pem: &str) -> String {
    format!("{CSR_NAME_PREFIX}{}", deterministic_hash(csr_pem))
}

/// CSR object for `request`
pub fn build_csr(
    name: &str,
    request: &SeedCertRequest,
    validity: Option<Duration>,
) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request.csr_pem().as_bytes().to_vec()),
            signer_name: CLIENT_SIGNER.to_string(),
            usages: Some(vec![
                "digital signature".to_string(),
                "key encipherment".to_string(),
                "client auth".to_string(),
            ]),
            expiration_seconds: validity.map(|v| i32::try_from(v.as_secs()).unwrap_or(i32::MAX)),
            ..Default::default()
        },
        status: None,
    }
}

/// How long to wait for approval and signing
pub fn default_poll() -> RetryConfig {
    RetryConfig {
        max_attempts: 40,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 1.5,
    }
}

/// Outcome of a successful handshake
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Name of the CSR object in the garden
    pub csr_name: String,
    /// Signed client certificate
    pub cert_pem: Vec<u8>,
    /// Matching private key
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("csr_name", &self.csr_name)
            .finish_non_exhaustive()
    }
}

/// Request a client certificate for `seed_name` and wait until it is issued
///
/// Pending requests are polled per `poll`; running out of attempts leaves a
/// retryable error. Denied and failed requests are permanent.
pub async fn request_certificate(
    api: &dyn CsrApi,
    seed_name: &str,
    validity: Option<Duration>,
    poll: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<IssuedCertificate, Error> {
    let request = SeedCertRequest::new(seed_name)?;
    let name = csr_name(request.csr_pem());
    let csr = build_csr(&name, &request, validity);

    retry_with_backoff(&RetryConfig::with_max_attempts(5), cancel, "create_csr", || {
        api.create(&csr)
    })
    .await?;
    info!(csr = %name, seed = %seed_name, "Created certificate signing request");

    let result = retry_with_backoff(poll, cancel, "wait_for_csr", || async {
        let state = api.get(&name).await?.map(|c| csr_state(&c));
        match state {
            Some(CsrState::Issued(cert)) => Ok(cert),
            Some(CsrState::Denied(msg)) => Err(Error::bootstrap_permanent(
                name.clone(),
                format!("certificate signing request denied: {msg}"),
            )),
            Some(CsrState::Failed(msg)) => Err(Error::bootstrap_permanent(
                name.clone(),
                format!("certificate signing request failed: {msg}"),
            )),
            Some(CsrState::Pending) => {
                debug!(csr = %name, "Certificate not yet issued");
                Err(Error::bootstrap_with_context(name.clone(), "certificate not yet issued"))
            }
            None => Err(Error::bootstrap_with_context(
                name.clone(),
                "certificate signing request not found",
            )),
        }
    })
    .await;

    match result {
        Ok(cert_pem) => {
            record_csr("issued");
            info!(csr = %name, "Certificate issued");
            Ok(IssuedCertificate {
                csr_name: name,
                cert_pem,
                key_pem: request.private_key_pem().as_bytes().to_vec(),
            })
        }
        Err(e) => {
            record_csr(if e.is_retryable() { "timeout" } else { "rejected" });
            warn!(csr = %name, error = %e, "Certificate request did not complete");
            Err(e)
        }
    }
}
