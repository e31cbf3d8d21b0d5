//! Move dependency-watchdog probing onto the token-requestor access secret
//!
//! For every live shoot namespace that still has the legacy internal probe
//! secret and a resource-manager deployment:
//!
//! 1. apply the new probe access secret and the ManagedResource granting the
//!    probe read access to node leases
//! 2. delete both legacy probe secrets
//! 3. switch the resource manager to a config that also watches
//!    `kube-node-lease`, via a new immutable config map

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use seedlet_common::crd::{LocalSecretReference, ManagedResource, ManagedResourceSpec};
use seedlet_common::flow::{apply_to_objects, ignore_not_found};
use seedlet_common::kube_utils::deterministic_hash;
use seedlet_common::Error;

use super::{shoot_namespace_selector, SeedKind, SeedObjects};

/// Legacy secret the probe used for the in-cluster endpoint
pub const INTERNAL_PROBE_SECRET: &str = "shoot-access-dependency-watchdog-internal-probe";
/// Legacy secret the probe used for the external endpoint
pub const EXTERNAL_PROBE_SECRET: &str = "shoot-access-dependency-watchdog-external-probe";
/// Token-requestor secret that replaces both legacy secrets
pub const PROBE_SECRET: &str = "shoot-access-dependency-watchdog-probe";
/// ManagedResource carrying the probe's RBAC in the shoot
pub const MANAGED_RESOURCE: &str = "shoot-core-dependency-watchdog";

const RESOURCE_MANAGER: &str = "seedlet-resource-manager";
const RESOURCE_MANAGER_CONFIG_VOLUME: &str = "config";
const RESOURCE_MANAGER_CONFIG_KEY: &str = "config.yaml";
const RESOURCE_MANAGER_CONFIG_KIND: &str = "ResourceManagerConfiguration";

const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";
const PROBE_SERVICE_ACCOUNT: &str = "dependency-watchdog-probe";
const PROBE_SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";
const TARGET_ROLE: &str = "seedlet.dev:target:dependency-watchdog";

const GC_REFERENCE_LABEL: &str = "resources.seedlet.dev/garbage-collectable-reference";
const REFERENCE_ANNOTATION_PREFIX: &str = "reference.resources.seedlet.dev";

/// Resource-manager component configuration, selected by `apiVersion`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "apiVersion")]
pub enum ResourceManagerConfig {
    /// `resourcemanager.config.seedlet.dev/v1alpha1`
    #[serde(rename = "resourcemanager.config.seedlet.dev/v1alpha1")]
    V1Alpha1(ResourceManagerConfiguration),
}

/// The fields of the resource-manager config this routine edits; the rest
/// passes through untouched
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManagerConfiguration {
    /// Always `ResourceManagerConfiguration`
    pub kind: String,
    /// Connection to the shoot cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_connection: Option<TargetClientConnection>,
    /// Unmodelled fields
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

/// Target cluster connection settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TargetClientConnection {
    /// Namespaces the resource manager watches in the shoot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Unmodelled fields
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

impl ResourceManagerConfig {
    /// Decode a `config.yaml`; unknown versions and kinds are errors
    pub fn decode(data: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(data).map_err(|e| {
            Error::serialization_for_kind(RESOURCE_MANAGER_CONFIG_KIND, e.to_string())
        })?;
        let ResourceManagerConfig::V1Alpha1(inner) = &config;
        if inner.kind != RESOURCE_MANAGER_CONFIG_KIND {
            return Err(Error::serialization_for_kind(
                RESOURCE_MANAGER_CONFIG_KIND,
                format!("unexpected kind {:?}", inner.kind),
            ));
        }
        Ok(config)
    }

    /// Encode back to YAML
    pub fn encode(&self) -> Result<String, Error> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind(RESOURCE_MANAGER_CONFIG_KIND, e.to_string()))
    }

    /// Add `kube-node-lease` to the watched namespaces; false if nothing changed
    pub fn watch_node_leases(&mut self) -> bool {
        let ResourceManagerConfig::V1Alpha1(inner) = self;
        match inner.target_client_connection.as_mut() {
            Some(target) if !target.namespaces.iter().any(|n| n == NODE_LEASE_NAMESPACE) => {
                target.namespaces.push(NODE_LEASE_NAMESPACE.to_string());
                true
            }
            _ => false,
        }
    }
}

fn short_hash(input: &str) -> String {
    deterministic_hash(input).chars().take(8).collect()
}

fn reference_annotation(kind: &str, name: &str) -> String {
    format!("{REFERENCE_ANNOTATION_PREFIX}/{kind}-{}", short_hash(name))
}

fn terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating")
}

/// Kubeconfig for the probe; the token is filled in by the token requestor
pub fn probe_kubeconfig(namespace: &str) -> Result<String, Error> {
    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": namespace,
            "cluster": { "server": format!("https://kube-apiserver.{namespace}.svc") }
        }],
        "contexts": [{ "name": namespace, "context": { "cluster": namespace, "user": namespace } }],
        "current-context": namespace,
        "preferences": {},
        "users": [{ "name": namespace, "user": {} }],
    });
    Ok(serde_yaml::to_string(&kubeconfig)?)
}

/// Token-requestor secret for the probe's service account in the shoot
pub fn probe_secret(namespace: &str) -> Result<Secret, Error> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(PROBE_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([
                (
                    "serviceaccount.resources.seedlet.dev/name".to_string(),
                    PROBE_SERVICE_ACCOUNT.to_string(),
                ),
                (
                    "serviceaccount.resources.seedlet.dev/namespace".to_string(),
                    PROBE_SERVICE_ACCOUNT_NAMESPACE.to_string(),
                ),
            ])),
            labels: Some(BTreeMap::from([
                ("resources.seedlet.dev/purpose".to_string(), "token-requestor".to_string()),
                ("resources.seedlet.dev/class".to_string(), "shoot".to_string()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            "kubeconfig".to_string(),
            ByteString(probe_kubeconfig(namespace)?.into_bytes()),
        )])),
        ..Default::default()
    })
}

fn target_rbac() -> (Role, RoleBinding) {
    let meta = ObjectMeta {
        name: Some(TARGET_ROLE.to_string()),
        namespace: Some(NODE_LEASE_NAMESPACE.to_string()),
        ..Default::default()
    };
    let role = Role {
        metadata: meta.clone(),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["coordination.k8s.io".to_string()]),
            resources: Some(vec!["leases".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string()],
            ..Default::default()
        }]),
    };
    let binding = RoleBinding {
        metadata: meta,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: TARGET_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: PROBE_SERVICE_ACCOUNT.to_string(),
            namespace: Some(PROBE_SERVICE_ACCOUNT_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    };
    (role, binding)
}

/// Immutable ManagedResource secret holding the probe's RBAC; its name
/// carries a hash of the content
pub fn target_rbac_secret(namespace: &str) -> Result<Secret, Error> {
    let (role, binding) = target_rbac();
    let file = |kind: &str| {
        format!("{kind}__{NODE_LEASE_NAMESPACE}__{}.yaml", TARGET_ROLE.replace(':', "_"))
    };
    let data = BTreeMap::from([
        (file("role"), serde_yaml::to_string(&role)?),
        (file("rolebinding"), serde_yaml::to_string(&binding)?),
    ]);
    let digest = short_hash(&data.values().cloned().collect::<Vec<_>>().concat());

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(format!("managedresource-{MANAGED_RESOURCE}-{digest}")),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(GC_REFERENCE_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        immutable: Some(true),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    })
}

/// ManagedResource pointing at `secret_name`
pub fn probe_managed_resource(namespace: &str, secret_name: &str) -> ManagedResource {
    let mut mr = ManagedResource::new(
        MANAGED_RESOURCE,
        ManagedResourceSpec {
            secret_refs: vec![LocalSecretReference {
                name: secret_name.to_string(),
            }],
            class: None,
            inject_labels: BTreeMap::from([(
                "shoot.seedlet.dev/no-cleanup".to_string(),
                "true".to_string(),
            )]),

            keep_objects: Some(false),
        },
    );
    mr.metadata.namespace = Some(namespace.to_string());
    mr.metadata.labels = Some(BTreeMap::from([("origin".to_string(), "seedlet".to_string())]));
    mr.metadata.annotations = Some(BTreeMap::from([(
        reference_annotation("secret", secret_name),
        secret_name.to_string(),
    )]));
    mr
}

/// Migrate every live shoot namespace; each namespace is one task
pub async fn migrate_probe_access(
    seed: &dyn SeedObjects,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let namespaces: Vec<Namespace> = seed
        .list_namespaces(&shoot_namespace_selector())
        .await?
        .into_iter()
        .filter(|ns| !terminating(ns))
        .collect();

    apply_to_objects("migrate-probe-access", cancel, namespaces, |ns, _| async move {
        migrate_namespace(seed, &ns.name_any()).await
    })
    .await?;
    Ok(())
}

async fn migrate_namespace(seed: &dyn SeedObjects, namespace: &str) -> Result<(), Error> {
    if seed.get_secret(namespace, INTERNAL_PROBE_SECRET).await?.is_none() {
        return Ok(());
    }
    let Some(deployment) = seed.get_deployment(namespace, RESOURCE_MANAGER).await? else {
        return Ok(());
    };
    info!(namespace, "Migrating dependency-watchdog probe access");

    seed.apply_secret(&probe_secret(namespace)?).await?;
    let rbac = target_rbac_secret(namespace)?;
    seed.apply_secret(&rbac).await?;
    seed.apply_managed_resource(&probe_managed_resource(namespace, &rbac.name_any()))
        .await?;

    for legacy in [INTERNAL_PROBE_SECRET, EXTERNAL_PROBE_SECRET] {
        ignore_not_found(seed.delete(SeedKind::Secret, namespace, legacy).await)?;
    }

    switch_resource_manager_config(seed, namespace, &deployment).await
}

async fn switch_resource_manager_config(
    seed: &dyn SeedObjects,
    namespace: &str,
    deployment: &k8s_openapi::api::apps::v1::Deployment,
) -> Result<(), Error> {
    let mut volumes = match deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|p| serde_json::to_value(&p.volumes))
        .transpose()?
    {
        Some(Value::Array(volumes)) => volumes,
        _ => return Ok(()),
    };
    let Some((index, current)) = volumes.iter().enumerate().find_map(|(i, v)| {
        (v["name"] == RESOURCE_MANAGER_CONFIG_VOLUME)
            .then(|| v["configMap"]["name"].as_str().map(|n| (i, n.to_string())))
            .flatten()
    }) else {
        return Ok(());
    };

    let Some(config_map) = seed.get_config_map(namespace, &current).await? else {
        return Ok(());
    };
    let data = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(RESOURCE_MANAGER_CONFIG_KEY))
        .map(String::as_str)
        .unwrap_or_default();
    let mut config = ResourceManagerConfig::decode(data)?;
    if !config.watch_node_leases() {
        debug!(namespace, "Resource manager already watches node leases");
        return Ok(());
    }
    let encoded = config.encode()?;

    let name = format!("{RESOURCE_MANAGER}-dwd-{}", short_hash(&encoded));
    let unique = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(GC_REFERENCE_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        },
        immutable: Some(true),
        data: Some(BTreeMap::from([(RESOURCE_MANAGER_CONFIG_KEY.to_string(), encoded)])),
        ..Default::default()
    };
    match seed.create_config_map(&unique).await {
        Err(e) if e.is_already_exists() => {}
        other => other?,
    }

    volumes[index]["configMap"]["name"] = Value::String(name.clone());
    let patch = json!({
        "spec": {
            "template": {
                "metadata": { "annotations": { reference_annotation("configmap", &name): name } },
                "spec": { "volumes": volumes }
            }
        }
    });
    seed.patch(SeedKind::Deployment, namespace, RESOURCE_MANAGER, &patch)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::MockSeedObjects;
    use k8s_openapi::api::apps::v1::Deployment;

    const NS: &str = "shoot--dev--a";

    const RM_CONFIG: &str = "\
apiVersion: resourcemanager.config.seedlet.dev/v1alpha1
kind: ResourceManagerConfiguration
sourceClientConnection:
  namespace: shoot--dev--a
targetClientConnection:
  kubeconfig: /var/run/secrets/target/kubeconfig
  namespaces:
  - kube-system
";

    fn namespace(name: &str, phase: Option<&str>) -> Namespace {
        serde_json::from_value(json!({
            "metadata": { "name": name },
            "status": { "phase": phase },
        }))
        .unwrap()
    }

    fn resource_manager() -> Deployment {
        serde_json::from_value(json!({
            "metadata": { "name": RESOURCE_MANAGER, "namespace": NS },
            "spec": {
                "selector": {},
                "template": { "spec": {
                    "containers": [],
                    "volumes": [
                        { "name": "certs", "secret": { "secretName": "tls" } },
                        {
                            "name": "config",
                            "configMap": { "name": "seedlet-resource-manager-abc" }
                        },
                    ]
                } }
            }
        }))
        .unwrap()
    }

    fn config_map(yaml: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(
                RESOURCE_MANAGER_CONFIG_KEY.to_string(),
                yaml.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn text(secret: &Secret, key: &str) -> String {
        let bytes = &secret.data.as_ref().unwrap()[key].0;
        String::from_utf8(bytes.clone()).unwrap()
    }

    #[test]
    fn probe_kubeconfig_targets_in_cluster_apiserver() {
        let secret = probe_secret(NS).unwrap();
        let kubeconfig: Value = serde_yaml::from_str(&text(&secret, "kubeconfig")).unwrap();
        assert_eq!(
            kubeconfig["clusters"][0]["cluster"]["server"],
            "https://kube-apiserver.shoot--dev--a.svc"
        );
        assert_eq!(kubeconfig["current-context"], NS);
        assert_eq!(kubeconfig["users"][0]["user"], json!({}));
        assert_eq!(secret.labels()["resources.seedlet.dev/purpose"], "token-requestor");
        assert_eq!(
            secret.annotations()["serviceaccount.resources.seedlet.dev/namespace"],
            "kube-system"
        );
    }

    #[test]
    fn rbac_secret_is_immutable_and_content_addressed() {
        let a = target_rbac_secret(NS).unwrap();
        let b = target_rbac_secret("shoot--dev--b").unwrap();
        assert_eq!(a.immutable, Some(true));
        assert_eq!(a.name_any(), b.name_any());
        assert!(a.name_any().starts_with("managedresource-shoot-core-dependency-watchdog-"));

        let role: Role = serde_yaml::from_str(&text(
            &a,
            "role__kube-node-lease__seedlet.dev_target_dependency-watchdog.yaml",
        ))
        .unwrap();
        assert_eq!(role.metadata.namespace.as_deref(), Some(NODE_LEASE_NAMESPACE));
        assert_eq!(role.rules.unwrap()[0].verbs, vec!["get", "list"]);

        let binding: RoleBinding = serde_yaml::from_str(&text(
            &a,
            "rolebinding__kube-node-lease__seedlet.dev_target_dependency-watchdog.yaml",
        ))
        .unwrap();
        assert_eq!(binding.subjects.unwrap()[0].name, PROBE_SERVICE_ACCOUNT);
    }

    #[test]
    fn managed_resource_references_its_secret() {
        let mr = probe_managed_resource(NS, "managedresource-x");
        assert_eq!(mr.spec.secret_refs[0].name, "managedresource-x");
        assert_eq!(mr.spec.keep_objects, Some(false));
        assert_eq!(mr.spec.inject_labels["shoot.seedlet.dev/no-cleanup"], "true");
        assert!(mr.annotations().iter().any(|(k, v)| {
            k.starts_with("reference.resources.seedlet.dev/secret-") && v == "managedresource-x"
        }));
    }

    #[test]
    fn config_gains_node_lease_namespace_and_keeps_other_fields() {
        let mut config = ResourceManagerConfig::decode(RM_CONFIG).unwrap();
        assert!(config.watch_node_leases());
        assert!(!config.watch_node_leases());

        let round: Value = serde_yaml::from_str(&config.encode().unwrap()).unwrap();
        assert_eq!(round["apiVersion"], "resourcemanager.config.seedlet.dev/v1alpha1");
        let target = &round["targetClientConnection"];
        assert_eq!(target["namespaces"], json!(["kube-system", "kube-node-lease"]));
        assert_eq!(target["kubeconfig"], "/var/run/secrets/target/kubeconfig");
        assert_eq!(round["sourceClientConnection"]["namespace"], NS);
    }

    #[test]
    fn config_without_target_connection_is_unchanged() {
        let mut config = ResourceManagerConfig::decode(concat!(
            "apiVersion: resourcemanager.config.seedlet.dev/v1alpha1\n",
            "kind: ResourceManagerConfiguration\n",
        ))
        .unwrap();
        assert!(!config.watch_node_leases());
    }

    #[test]
    fn unknown_config_version_is_rejected() {
        let unknown = "apiVersion: v9\nkind: ResourceManagerConfiguration\n";
        let err = ResourceManagerConfig::decode(unknown).unwrap_err();

        assert!(matches!(err, Error::Serialization { .. }));
        let err = ResourceManagerConfig::decode(
            "apiVersion: resourcemanager.config.seedlet.dev/v1alpha1\nkind: Other\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[tokio::test]
    async fn story_legacy_namespace_is_fully_migrated() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_namespaces()
            .returning(|_| {
                Ok(vec![
                    namespace(NS, Some("Active")),
                    namespace("shoot--dev--gone", Some("Terminating")),
                ])
            });
        seed.expect_get_secret()
            .withf(|ns, name| ns.to_string() == NS && name.to_string() == INTERNAL_PROBE_SECRET)
            .returning(|_, _| Ok(Some(Secret::default())));
        seed.expect_get_deployment()
            .withf(|ns, _| ns.to_string() == NS)
            .returning(|_, _| Ok(Some(resource_manager())));
        seed.expect_apply_secret()
            .withf(|s| s.name_any() == PROBE_SECRET || s.name_any().starts_with("managedresource-"))
            .times(2)
            .returning(|_| Ok(()));
        seed.expect_apply_managed_resource()
            .withf(|mr| mr.name_any() == MANAGED_RESOURCE && mr.namespace().as_deref() == Some(NS))
            .times(1)
            .returning(|_| Ok(()));
        seed.expect_delete()
            .withf(|kind, _, name| {
                let name = name.to_string();
                *kind == SeedKind::Secret
                    && (name == INTERNAL_PROBE_SECRET || name == EXTERNAL_PROBE_SECRET)
            })
            .times(2)
            .returning(|_, _, name| {
                if name == EXTERNAL_PROBE_SECRET {
                    Err(seedlet_common::error::api_error(404, "NotFound").into())
                } else {
                    Ok(())
                }
            });
        seed.expect_get_config_map()
            .withf(|_, name| name.to_string() == "seedlet-resource-manager-abc")
            .returning(|_, _| Ok(Some(config_map(RM_CONFIG))));
        seed.expect_create_config_map()
            .withf(|cm| {
                cm.immutable == Some(true)
                    && cm.name_any().starts_with("seedlet-resource-manager-dwd-")
                    && cm.data.as_ref().unwrap()[RESOURCE_MANAGER_CONFIG_KEY]
                        .contains(NODE_LEASE_NAMESPACE)
            })
            .times(1)
            .returning(|_| Err(seedlet_common::error::api_error(409, "AlreadyExists").into()));
        seed.expect_patch()
            .withf(|kind, ns, name, patch| {
                let volumes = &patch["spec"]["template"]["spec"]["volumes"];
                *kind == SeedKind::Deployment
                    && ns.to_string() == NS
                    && name.to_string() == RESOURCE_MANAGER
                    && volumes[0]["name"] == "certs"
                    && volumes[1]["configMap"]["name"]
                        .as_str()
                        .is_some_and(|n| n.starts_with("seedlet-resource-manager-dwd-"))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        migrate_probe_access(&seed, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn namespace_without_legacy_secret_is_untouched() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_namespaces().returning(|_| Ok(vec![namespace(NS, None)]));
        seed.expect_get_secret().returning(|_, _| Ok(None));
        seed.expect_get_deployment().never();
        seed.expect_apply_secret().never();

        migrate_probe_access(&seed, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn already_watching_resource_manager_is_not_patched() {
        let mut seed = MockSeedObjects::new();
        seed.expect_get_config_map().returning(|_, _| {
            let watching =
                RM_CONFIG.replace("  - kube-system\n", "  - kube-system\n  - kube-node-lease\n");
            Ok(Some(config_map(&watching)))

        });
        seed.expect_create_config_map().never();
        seed.expect_patch().never();

        switch_resource_manager_config(&seed, NS, &resource_manager()).await.unwrap();
    }
}
