//! Mark shoots interrupted by an agent restart as aborted

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use seedlet_cache::ScopedClient;
use seedlet_common::crd::{LastOperationState, Shoot};
use seedlet_common::flow::apply_to_objects;
use seedlet_common::Error;

/// Garden shoot access needed to abort operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShootStatusApi: Send + Sync {
    /// Every shoot visible to this seed
    async fn list_shoots(&self) -> Result<Vec<Shoot>, Error>;
    /// Merge-patch a shoot's status subresource
    async fn patch_shoot_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;
}

#[async_trait]
impl ShootStatusApi for ScopedClient {
    async fn list_shoots(&self) -> Result<Vec<Shoot>, Error> {
        self.list::<Shoot>(None).await
    }

    async fn patch_shoot_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.merge_patch_status::<Shoot>(Some(namespace), name, patch)
            .await
            .map(|_| ())
    }
}

fn aborted_patch() -> Result<Value, Error> {
    let state = serde_json::to_value(LastOperationState::Aborted)?;
    Ok(json!({
        "status": { "lastOperation": { "state": state } }
    }))

}

/// Set `lastOperation.state=Aborted` on every shoot of `seed` still marked processing
pub async fn abort_processing_shoots(
    api: &dyn ShootStatusApi,
    seed: &str,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let shoots: Vec<Shoot> = api
        .list_shoots()
        .await?
        .into_iter()
        .filter(|s| s.responsible_seed() == Some(seed) && s.is_processing())
        .collect();
    if shoots.is_empty() {
        return Ok(());
    }
    info!(seed, count = shoots.len(), "Aborting shoot operations interrupted by restart");

    let patch = aborted_patch()?;
    let patch = &patch;
    apply_to_objects("abort-processing-shoots", cancel, shoots, |shoot, _| async move {
        let namespace = shoot.namespace().unwrap_or_default();
        api.patch_shoot_status(&namespace, &shoot.name_any(), patch).await
    })
    .await?;
    Ok(())
}
