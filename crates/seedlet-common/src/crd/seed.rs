//! Seed resource: a seed cluster's identity in the garden

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Seed registers a cluster that hosts shoot control planes.
///
/// Example:
/// ```yaml
/// apiVersion: core.seedlet.dev/v1beta1
/// kind: Seed
/// metadata:
///   name: aws-eu1
/// spec:
///   provider:
///     type: aws
///     region: eu-west-1
///   networks:
///     pods: 100.96.0.0/11
///     services: 100.64.0.0/13
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.seedlet.dev",
    version = "v1beta1",
    kind = "Seed",
    derive = "PartialEq",
    status = "SeedStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.provider.region"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SeedSpec {
    /// Infrastructure the seed runs on
    pub provider: SeedProvider,

    /// CIDRs used by the seed cluster
    pub networks: SeedNetworks,

    /// Ingress domain and controller for shoot endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Ingress>,

    /// DNS provider used for seed-level records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<SeedDns>,

    /// Object storage for shoot etcd backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<SeedBackup>,

    /// Feature toggles for seed-level components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SeedSettings>,

    /// Taints that keep shoots off this seed unless tolerated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<SeedTaint>,
}

/// Seed infrastructure
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedProvider {
    /// Provider type, e.g. "aws"
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Provider region
    pub region: String,
    /// Availability zones, if pinned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
}

/// Seed network ranges
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedNetworks {
    /// Node CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    /// Pod CIDR
    pub pods: String,
    /// Service CIDR
    pub services: String,
    /// Defaults applied to shoots scheduled onto this seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoot_defaults: Option<ShootNetworkDefaults>,
}

/// Default shoot CIDRs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootNetworkDefaults {
    /// Default pod CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<String>,
    /// Default service CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<String>,
}

/// Ingress configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// Wildcard domain for shoot ingresses
    pub domain: String,
    /// Ingress controller kind, e.g. "nginx"
    pub controller_kind: String,
}

/// DNS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedDns {
    /// DNS provider type
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Secret with provider credentials
    pub secret_ref: SecretReference,
}

/// Backup configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedBackup {
    /// Storage provider type
    pub provider: String,
    /// Storage region, defaults to the seed region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Secret with storage credentials
    pub secret_ref: SecretReference,
}

/// Reference to a secret in any namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Seed settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedSettings {
    /// Whether the scheduler may place new shoots here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_visible: Option<bool>,
    /// Run the dependency-watchdog prober for shoot control planes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_watchdog_prober: Option<bool>,
    /// Run the vertical pod autoscaler in the seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_pod_autoscaler: Option<bool>,
    /// Free-form settings owned by extensions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Seed taint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedTaint {
    /// Taint key
    pub key: String,
    /// Optional value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Seed status, written by garden controllers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedStatus {
    /// Kubernetes version of the seed cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Last generation acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Stable identity of the seed cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_identity: Option<String>,
}
