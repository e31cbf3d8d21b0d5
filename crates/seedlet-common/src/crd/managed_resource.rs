//! ManagedResource: a bundle of manifests applied by the resource manager

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ManagedResource points at secrets holding manifests for one component.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resources.seedlet.dev",
    version = "v1alpha1",
    kind = "ManagedResource",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Secrets whose data keys are manifests
    #[serde(default)]
    pub secret_refs: Vec<LocalSecretReference>,
    /// Resource-manager class; unset means the shoot's target cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Labels added to every applied object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inject_labels: BTreeMap<String, String>,
    /// Keep applied objects when the ManagedResource is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_objects: Option<bool>,
}

/// Reference to a secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalSecretReference {
    /// Secret name
    pub name: String,
}
