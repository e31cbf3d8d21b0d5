//! Resource definitions used by seedlet
//!
//! Seed and Shoot live in the garden; ManagedResource lives in the seed.

mod garden;
mod managed_resource;
mod seed;
mod shoot;

pub use garden::{
    Bastion, BastionSpec, ControllerInstallation, ControllerInstallationSpec, ObjectReference,
};
pub use managed_resource::{LocalSecretReference, ManagedResource, ManagedResourceSpec};
pub use seed::{
    Ingress, SecretReference, Seed, SeedBackup, SeedDns, SeedNetworks, SeedProvider,
    SeedSettings, SeedSpec, SeedStatus, SeedTaint, ShootNetworkDefaults,
};
pub use shoot::{LastOperation, LastOperationState, Shoot, ShootSpec, ShootStatus};
