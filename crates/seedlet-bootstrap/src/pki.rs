//! Key, CSR and certificate handling for the garden client credential
//!
//! The agent generates its own ECDSA key pair and only ever sends the CSR to
//! the garden. The private key stays in the kubeconfig secret on the seed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use thiserror::Error;
use x509_parser::prelude::*;

/// Common name prefix identifying seed agents to the garden authorizer
pub const SEED_USER_PREFIX: &str = "seedlet:system:seed:";

/// Organization all seed agents belong to
pub const SEED_GROUP: &str = "seedlet:system:seeds";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// CSR generation failed
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// Certificate or PEM parsing failed
    #[error("certificate parsing error: {0}")]
    Parse(String),
}

impl From<PkiError> for seedlet_common::Error {
    fn from(e: PkiError) -> Self {
        seedlet_common::Error::bootstrap_permanent("pki", e.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Decode the first PEM block into DER
pub fn parse_pem(pem_data: &[u8]) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data).map_err(|e| PkiError::Parse(format!("invalid PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

/// Locally generated key pair plus the CSR sent to the garden
#[derive(Clone)]
pub struct SeedCertRequest {
    key_pem: String,
    csr_pem: String,
}

impl SeedCertRequest {
    /// Generate a fresh key pair and a client-auth CSR for `seed_name`
    pub fn new(seed_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate seed key: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("{SEED_USER_PREFIX}{seed_name}")),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(SEED_GROUP.to_string()),
        );
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| PkiError::CsrGeneration(e.to_string()))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| PkiError::CsrGeneration(format!("failed to encode CSR: {e}")))?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// CSR in PEM form
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM form
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl std::fmt::Debug for SeedCertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedCertRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

/// Validity window and subject of an issued certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Subject common name
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse a PEM-encoded certificate
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        Self::from_der(&parse_pem(pem_data)?)
    }

    /// Parse a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            not_before,
            not_after,
            common_name,
        })
    }

    /// Total lifetime
    pub fn lifetime(&self) -> ChronoDuration {
        self.not_after - self.not_before
    }

    /// True once `now` is past the end of validity
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Point at which `fraction` of the lifetime has passed
    pub fn deadline_at_fraction(&self, fraction: f64) -> DateTime<Utc> {
        let lifetime_ms = self.lifetime().num_milliseconds() as f64;
        self.not_before + ChronoDuration::milliseconds((lifetime_ms * fraction) as i64)
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::Parse(format!("timestamp {secs} out of range")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Self-signed client certificate with the given validity years
    pub(crate) fn test_cert(cn: &str, from_year: i32, to_year: i32) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        params.distinguished_name = dn;
        params.not_before = rcgen::date_time_ymd(from_year, 1, 1);
        params.not_after = rcgen::date_time_ymd(to_year, 1, 1);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn csr_carries_seed_identity() {
        let req = SeedCertRequest::new("aws-eu1").unwrap();
        assert!(req.csr_pem().contains("BEGIN CERTIFICATE REQUEST"));
        assert!(req.private_key_pem().contains("PRIVATE KEY"));

        let der = parse_pem(req.csr_pem().as_bytes()).unwrap();
        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
        let subject = &csr.certification_request_info.subject;
        let cn = subject.iter_common_name().next().unwrap().as_str().unwrap();
        let org = subject.iter_organization().next().unwrap().as_str().unwrap();
        assert_eq!(cn, "seedlet:system:seed:aws-eu1");
        assert_eq!(org, SEED_GROUP);
    }

    #[test]
    fn each_request_has_its_own_key() {
        let a = SeedCertRequest::new("aws-eu1").unwrap();
        let b = SeedCertRequest::new("aws-eu1").unwrap();
        assert_ne!(a.private_key_pem(), b.private_key_pem());
    }

    #[test]
    fn debug_hides_private_key() {
        let req = SeedCertRequest::new("aws-eu1").unwrap();
        assert!(!format!("{req:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn parses_validity_window() {
        let (cert, _) = test_cert("seedlet:system:seed:aws-eu1", 2020, 2030);
        let info = CertificateInfo::from_pem(cert.as_bytes()).unwrap();
        assert_eq!(info.common_name, "seedlet:system:seed:aws-eu1");
        assert_eq!(info.not_before.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert_eq!(info.not_after.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let (cert, _) = test_cert("x", 2020, 2021);
        let info = CertificateInfo::from_pem(cert.as_bytes()).unwrap();
        assert!(info.is_expired_at(Utc::now()));
        assert!(!info.is_expired_at(info.not_before));
        assert!(info.is_expired_at(info.not_after));
    }

    #[test]
    fn deadline_scales_with_lifetime() {
        let (cert, _) = test_cert("x", 2020, 2030);
        let info = CertificateInfo::from_pem(cert.as_bytes()).unwrap();
        assert_eq!(info.deadline_at_fraction(0.0), info.not_before);
        assert_eq!(info.deadline_at_fraction(1.0), info.not_after);
        let mid = info.deadline_at_fraction(0.5);
        assert!(mid > info.not_before && mid < info.not_after);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            CertificateInfo::from_pem(b"not pem"),
            Err(PkiError::Parse(_))
        ));
    }
}
