//! Garden credential bootstrap for seedlet
//!
//! Obtains the client certificate the agent uses against the garden cluster
//! through a CSR handshake, stores it as a kubeconfig secret on the seed,
//! cleans up bootstrap authentication afterwards and rotates the
//! certificate before it expires.

#![deny(missing_docs)]

pub mod checker;
pub mod cleanup;
pub mod csr;
pub mod kubeconfig;
pub mod manager;
pub mod pki;
pub mod rotation;
pub mod secrets;

use std::sync::Arc;

use once_cell::sync::OnceCell;

use seedlet_common::Error;

pub use checker::SeedConfigChecker;
pub use manager::GardenKubeconfigBootstrapper;
pub use rotation::{CredentialRotator, CredentialStore};

/// Garden credential produced by bootstrap
#[derive(Clone, PartialEq, Eq)]
pub struct GardenCredential {
    /// Kubeconfig for the garden cluster
    pub kubeconfig: Vec<u8>,
    /// CSR that produced the certificate, when one was requested
    pub csr_name: Option<String>,
    /// Seed the certificate was requested for, when one was requested
    pub seed_name: Option<String>,
}

impl GardenCredential {
    /// Credential that was already present; nothing to clean up
    pub fn existing(kubeconfig: Vec<u8>) -> Self {
        Self {
            kubeconfig,
            csr_name: None,
            seed_name: None,
        }
    }
}

impl std::fmt::Debug for GardenCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GardenCredential")
            .field("csr_name", &self.csr_name)
            .field("seed_name", &self.seed_name)
            .finish_non_exhaustive()
    }
}

/// Set-once slot shared between the bootstrapper and the garden runnable
#[derive(Clone, Debug, Default)]
pub struct BootstrapResult(Arc<OnceCell<GardenCredential>>);

impl BootstrapResult {
    /// Empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the credential; a second call is an internal error
    pub fn set(&self, credential: GardenCredential) -> Result<(), Error> {
        self.0.set(credential).map_err(|_| {
            Error::internal_with_context("bootstrap", "bootstrap result already populated")
        })
    }

    /// The credential, once bootstrap finished
    pub fn get(&self) -> Option<&GardenCredential> {
        self.0.get()
    }
}
