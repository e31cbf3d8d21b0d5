//! Common types and utilities for seedlet

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod flow;
pub mod health;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Namespace for seedlet's own objects in both clusters
pub const GARDEN_NAMESPACE: &str = "garden";

/// Prefix of the garden namespace created for each seed
pub const SEED_NAMESPACE_PREFIX: &str = "seed-";

/// Prefix of shoot control-plane namespaces in the seed
pub const SHOOT_NAMESPACE_PREFIX: &str = "shoot--";

/// Role label on namespaces and components
pub const ROLE_LABEL: &str = "seedlet.dev/role";
/// Role value for seeds
pub const ROLE_SEED: &str = "seed";
/// Role value for shoot control-plane namespaces
pub const ROLE_SHOOT: &str = "shoot";
/// Role value for seed system components
pub const ROLE_SYSTEM_COMPONENT: &str = "system-component";

/// Annotation requesting an operation on an object
pub const OPERATION_ANNOTATION: &str = "seedlet.dev/operation";
/// Operation value asking for credential renewal
pub const OPERATION_RENEW: &str = "renew";

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "seedlet";

/// Garden namespace that belongs to `seed`
pub fn seed_namespace(seed: &str) -> String {
    format!("{SEED_NAMESPACE_PREFIX}{seed}")
}

/// Label that marks shoots scheduled onto `seed`
pub fn seed_shoot_label(seed: &str) -> String {
    format!("name.seed.seedlet.dev/{seed}")
}
