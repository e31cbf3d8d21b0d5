//! Garden-side resources that seedlet only watches

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ControllerInstallation binds an extension controller to a seed.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.seedlet.dev",
    version = "v1beta1",
    kind = "ControllerInstallation"
)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInstallationSpec {
    /// Seed the controller is installed into
    pub seed_ref: ObjectReference,
    /// Registration that describes the controller
    pub registration_ref: ObjectReference,
    /// Deployment that ships it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<ObjectReference>,
}

/// Bastion gives temporary SSH access to a shoot's nodes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operations.seedlet.dev",
    version = "v1alpha1",
    kind = "Bastion",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BastionSpec {
    /// Shoot the bastion belongs to
    pub shoot_ref: ObjectReference,
    /// Seed hosting the shoot's control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
    /// Public SSH key of the requester
    pub ssh_public_key: String,
}

/// Name-only object reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectReference {
    /// Object name
    pub name: String,
}
