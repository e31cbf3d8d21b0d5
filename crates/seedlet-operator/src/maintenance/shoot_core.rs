//! Remove the retired `shoot-core` ManagedResource from shoot namespaces

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use seedlet_common::flow::{apply_to_objects, ignore_not_found};
use seedlet_common::Error;

use super::{shoot_namespace_selector, SeedKind, SeedObjects};

const MANAGED_RESOURCE: &str = "shoot-core";
const MANAGED_RESOURCE_SECRET: &str = "managedresource-shoot-core";

/// Delete `shoot-core` and its secret in every shoot namespace; absence is success
pub async fn delete_legacy_shoot_core(
    seed: &dyn SeedObjects,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let namespaces = seed.list_namespaces(&shoot_namespace_selector()).await?;
    apply_to_objects("delete-legacy-shoot-core", cancel, namespaces, |ns, _| async move {
        let namespace = ns.name_any();
        ignore_not_found(
            seed.delete(SeedKind::ManagedResource, &namespace, MANAGED_RESOURCE)
                .await,
        )?;
        ignore_not_found(
            seed.delete(SeedKind::Secret, &namespace, MANAGED_RESOURCE_SECRET)
                .await,
        )
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::MockSeedObjects;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use seedlet_common::error::api_error;

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_already_deleted_objects_count_as_done() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_namespaces()
            .withf(|s| s.to_string() == "seedlet.dev/role=shoot")
            .returning(|_| Ok(vec![namespace("shoot--dev--a"), namespace("shoot--dev--b")]));
        seed.expect_delete()
            .times(4)
            .returning(|kind, ns, _| match (kind, ns) {
                (SeedKind::ManagedResource, "shoot--dev--b") => {
                    Err(api_error(404, "NotFound").into())
                }

                _ => Ok(()),
            });

        delete_legacy_shoot_core(&seed, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn failures_in_one_namespace_are_reported() {
        let mut seed = MockSeedObjects::new();
        seed.expect_list_namespaces()
            .returning(|_| Ok(vec![namespace("shoot--dev--a"), namespace("shoot--dev--b")]));
        seed.expect_delete().returning(|_, ns, _| {
            if ns == "shoot--dev--a" {
                Err(api_error(500, "InternalError").into())
            } else {
                Ok(())
            }
        });

        let err = delete_legacy_shoot_core(&seed, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Flow { failures: 1, .. }));
    }
}
