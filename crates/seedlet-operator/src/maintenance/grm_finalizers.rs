//! Strip legacy resource-manager finalizers from ManagedResource secrets

use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use seedlet_common::flow::apply_to_objects;
use seedlet_common::{Error, GARDEN_NAMESPACE, ROLE_LABEL, ROLE_SYSTEM_COMPONENT};

use super::{SeedKind, SeedObjects};

/// Finalizer prefix the old resource manager put on referenced secrets
pub const LEGACY_FINALIZER_PREFIX: &str = "resources.seedlet.dev/seedlet-resource-manager";

fn selector() -> String {
    format!("{ROLE_LABEL} notin ({ROLE_SYSTEM_COMPONENT})")
}

/// Remove legacy finalizers from every secret referenced by a shoot ManagedResource
///
/// A missing ManagedResource API means a brand-new seed and is skipped.
pub async fn cleanup_legacy_finalizers(
    seed: &dyn SeedObjects,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let Some(resources) = seed.list_managed_resources(&selector()).await? else {
        info!("ManagedResource API not installed yet, skipping finalizer cleanup");
        return Ok(());
    };

    let resources = resources
        .into_iter()
        .filter(|mr| mr.namespace().as_deref() != Some(GARDEN_NAMESPACE));

    apply_to_objects("cleanup-legacy-finalizers", cancel, resources, |mr, _| async move {
        let namespace = mr.namespace().unwrap_or_default();
        for reference in &mr.spec.secret_refs {
            let Some(secret) = seed.get_secret(&namespace, &reference.name).await? else {
                continue;
            };
            let finalizers = secret.finalizers();
            let kept: Vec<&String> = finalizers
                .iter()
                .filter(|f| !f.starts_with(LEGACY_FINALIZER_PREFIX))
                .collect();
            if kept.len() == finalizers.len() {
                continue;
            }
            debug!(namespace = %namespace, secret = %reference.name, "Removing legacy finalizers");
            let patch = json!({
                "metadata": {
                    "finalizers": kept,
                    "resourceVersion": secret.resource_version(),
                }
            });
            seed.patch(SeedKind::Secret, &namespace, &reference.name, &patch)
                .await?;
        }
        Ok(())
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::MockSeedObjects;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use seedlet_common::crd::{LocalSecretReference, ManagedResource, ManagedResourceSpec};

    fn managed_resource(namespace: &str, secrets: &[&str]) -> ManagedResource {
        let mut mr = ManagedResource::new(
            "extension",
            ManagedResourceSpec {
                secret_refs: secrets
                    .iter()
                    .map(|s| LocalSecretReference { name: s.to_string() })
                    .collect(),
                ..Default::default()
            },
        );
        mr.metadata.namespace = Some(namespace.to_string());
        mr
    }

    fn secret(name: &str, finalizers: &[&str]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("42".to_string()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn system_components_are_excluded() {
        assert_eq!(selector(), "seedlet.dev/role notin (system-component)");
    }

    #[tokio::test]
    async fn missing_api_is_skipped() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_managed_resources().returning(|_| Ok(None));
        seed.expect_get_secret().never();

        cleanup_legacy_finalizers(&seed, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn story_only_legacy_finalizers_are_removed_from_shoot_secrets() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_managed_resources().returning(|_| {
            Ok(Some(vec![
                managed_resource("shoot--dev--a", &["legacy", "clean", "gone"]),
                managed_resource(GARDEN_NAMESPACE, &["seed-owned"]),
            ]))
        });
        seed.expect_get_secret()
            .withf(|ns, _| ns.to_string() == "shoot--dev--a")
            .returning(|_, name| match name {
                "legacy" => Ok(Some(secret(
                    "legacy",
                    &[
                        "resources.seedlet.dev/seedlet-resource-manager-shoot",
                        "example.com/keep",
                    ],
                ))),
                "clean" => Ok(Some(secret("clean", &["example.com/keep"]))),
                _ => Ok(None),
            });
        seed.expect_patch()
            .withf(|kind, ns, name, patch| {
                *kind == SeedKind::Secret
                    && ns.to_string() == "shoot--dev--a"
                    && name.to_string() == "legacy"
                    && patch["metadata"]["finalizers"] == json!(["example.com/keep"])
                    && patch["metadata"]["resourceVersion"] == "42"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        cleanup_legacy_finalizers(&seed, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn list_failure_is_fatal() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_managed_resources()
            .returning(|_| Err(seedlet_common::error::api_error(403, "Forbidden").into()));

        let err = cleanup_legacy_finalizers(&seed, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_forbidden());
    }
}
