//! Complete the labels on persistent volumes in disk migration
//!
//! Migrating volumes carry the PVC name; the namespace label is derived from
//! the claim reference. Released volumes whose namespace is already gone are
//! deleted. Volumes without a claim reference cannot be resolved
//! automatically and are reported for manual intervention after every other
//! volume was handled.

use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use seedlet_common::flow::{ignore_not_found, parallel, Task};
use seedlet_common::Error;

use super::SeedObjects;

/// Label naming the namespace a migrating volume belongs to
pub const MIGRATION_NAMESPACE_LABEL: &str = "disk-migration.monitoring.seedlet.dev/namespace";
/// Label naming the claim a migrating volume belonged to
pub const MIGRATION_PVC_LABEL: &str = "disk-migration.monitoring.seedlet.dev/pvc-name";

const RELEASED: &str = "Released";

/// Label or delete every migrating volume; fails with
/// [`Error::ManualIntervention`] if any volume has no claim reference
pub async fn label_migrating_volumes(
    seed: &dyn SeedObjects,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let volumes = seed.list_persistent_volumes(MIGRATION_PVC_LABEL).await?;

    let mut tasks = Vec::new();
    let mut without_claim = Vec::new();

    for pv in volumes {
        if pv.labels().get(MIGRATION_NAMESPACE_LABEL).is_some_and(|v| !v.is_empty()) {
            continue;
        }
        let name = pv.name_any();
        let claim_namespace = pv
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .map(|c| c.namespace.clone().unwrap_or_default());
        let released = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(RELEASED);

        let Some(namespace) = claim_namespace else {
            without_claim.push(name);
            continue;
        };

        if released && !namespace_exists(seed, &namespace, &pv).await? {
            tasks.push(Task::new(name.clone(), move |_| async move {
                info!(
                    volume = %name,
                    namespace = %namespace,
                    "Deleting orphaned persistent volume in migration"
                );
                ignore_not_found(seed.delete_persistent_volume(&name).await)
            }));
            continue;
        }

        tasks.push(Task::new(name.clone(), move |_| async move {
            info!(
                volume = %name,
                namespace = %namespace,
                "Adding missing namespace label to persistent volume"
            );
            let patch = json!({
                "metadata": { "labels": { MIGRATION_NAMESPACE_LABEL: namespace } }
            });
            seed.patch_persistent_volume(&name, &patch).await
        }));
    }

    parallel("label-migrating-volumes", cancel, tasks).await?;

    if !without_claim.is_empty() {
        return Err(Error::manual_intervention(
            "PersistentVolume",
            format!(
                "volumes {without_claim:?} have no namespace label and no claimRef; \
                 add the label {MIGRATION_NAMESPACE_LABEL}=<namespace> by hand"
            ),
        ));
    }
    Ok(())
}

async fn namespace_exists(
    seed: &dyn SeedObjects,
    namespace: &str,
    pv: &PersistentVolume,
) -> Result<bool, Error> {
    seed.namespace_exists(namespace).await.map_err(|e| {
        Error::internal_with_context(
            "pv-labels",
            format!(
                "failed checking if namespace {namespace} still exists (volume {}): {e}",
                pv.name_any()
            ),

        )
    })
}
