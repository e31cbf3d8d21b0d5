//! One-shot startup fixups
//!
//! Every routine is idempotent and fans out per namespace or per object over
//! the task-flow engine, so one broken shoot namespace never blocks the rest.
//! Routines run in a fixed order; the first routine that fails aborts
//! startup.

pub mod aborted_shoots;
pub mod dwd_access;
pub mod grm_finalizers;
pub mod prometheus_config;
pub mod pv_labels;
pub mod shoot_core;

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolume, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use seedlet_common::crd::ManagedResource;
use seedlet_common::{Error, FIELD_MANAGER, ROLE_LABEL, ROLE_SHOOT};

pub use aborted_shoots::{abort_processing_shoots, ShootStatusApi};

/// Label selector for shoot control-plane namespaces
pub fn shoot_namespace_selector() -> String {
    format!("{ROLE_LABEL}={ROLE_SHOOT}")
}

/// Namespaced seed kinds the routines patch or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    /// core/v1 Secret
    Secret,
    /// core/v1 ConfigMap
    ConfigMap,
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// ManagedResource
    ManagedResource,
}

/// Seed cluster access shared by the maintenance routines
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeedObjects: Send + Sync {
    /// Namespaces matching a label selector
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>, Error>;
    /// Whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;
    /// A secret, if present
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
    /// A config map, if present
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error>;
    /// A deployment, if present
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;
    /// StatefulSets in all namespaces matching a label selector
    async fn list_stateful_sets(&self, selector: &str) -> Result<Vec<StatefulSet>, Error>;
    /// PersistentVolumes matching a label selector
    async fn list_persistent_volumes(&self, selector: &str) -> Result<Vec<PersistentVolume>, Error>;
    /// ManagedResources matching a label selector; `None` when the API is not installed
    async fn list_managed_resources(
        &self,
        selector: &str,
    ) -> Result<Option<Vec<ManagedResource>>, Error>;
    /// Create a config map
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;
    /// Server-side apply a secret
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;
    /// Server-side apply a ManagedResource
    async fn apply_managed_resource(&self, resource: &ManagedResource) -> Result<(), Error>;
    /// Merge-patch a namespaced object
    async fn patch(
        &self,
        kind: SeedKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;
    /// Delete a namespaced object
    async fn delete(&self, kind: SeedKind, namespace: &str, name: &str) -> Result<(), Error>;
    /// Merge-patch a PersistentVolume
    async fn patch_persistent_volume(&self, name: &str, patch: &Value) -> Result<(), Error>;
    /// Delete a PersistentVolume
    async fn delete_persistent_volume(&self, name: &str) -> Result<(), Error>;
}

/// [`SeedObjects`] backed by the seed cluster client
#[derive(Clone)]
pub struct KubeSeedObjects {
    client: Client,
}

impl KubeSeedObjects {
    /// Wrap a seed client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ns<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn merge_patch<K>(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.ns::<K>(namespace)
            .patch(name, &PatchParams::default(), &merge(patch))
            .await?;
        Ok(())
    }

    async fn delete_object<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.ns::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

fn labels(selector: &str) -> ListParams {
    ListParams::default().labels(selector)
}

fn merge(patch: &Value) -> Patch<&Value> {
    Patch::Merge(patch)
}

#[async_trait]
impl SeedObjects for KubeSeedObjects {
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&labels(selector)).await?.items)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.ns::<Secret>(namespace).get_opt(name).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.ns::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.ns::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn list_stateful_sets(&self, selector: &str) -> Result<Vec<StatefulSet>, Error> {
        let api: Api<StatefulSet> = Api::all(self.client.clone());
        Ok(api.list(&labels(selector)).await?.items)
    }

    async fn list_persistent_volumes(
        &self,
        selector: &str,
    ) -> Result<Vec<PersistentVolume>, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.list(&labels(selector)).await?.items)
    }

    async fn list_managed_resources(
        &self,
        selector: &str,
    ) -> Result<Option<Vec<ManagedResource>>, Error> {
        let api: Api<ManagedResource> = Api::all(self.client.clone());
        match api.list(&labels(selector)).await {
            Ok(list) => Ok(Some(list.items)),
            // the resource type is unknown to the API server
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or_default();
        self.ns::<ConfigMap>(namespace)
            .create(&PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.ns::<Secret>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(secret))
            .await?;
        Ok(())
    }

    async fn apply_managed_resource(&self, resource: &ManagedResource) -> Result<(), Error> {
        let namespace = resource.metadata.namespace.as_deref().unwrap_or_default();
        let name = resource.metadata.name.as_deref().unwrap_or_default();
        self.ns::<ManagedResource>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(resource))
            .await?;
        Ok(())
    }

    async fn patch(
        &self,
        kind: SeedKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        match kind {
            SeedKind::Secret => self.merge_patch::<Secret>(namespace, name, patch).await,
            SeedKind::ConfigMap => self.merge_patch::<ConfigMap>(namespace, name, patch).await,
            SeedKind::Deployment => self.merge_patch::<Deployment>(namespace, name, patch).await,
            SeedKind::StatefulSet => self.merge_patch::<StatefulSet>(namespace, name, patch).await,
            SeedKind::ManagedResource => {
                self.merge_patch::<ManagedResource>(namespace, name, patch).await
            }
        }
    }

    async fn delete(&self, kind: SeedKind, namespace: &str, name: &str) -> Result<(), Error> {
        match kind {
            SeedKind::Secret => self.delete_object::<Secret>(namespace, name).await,
            SeedKind::ConfigMap => self.delete_object::<ConfigMap>(namespace, name).await,
            SeedKind::Deployment => self.delete_object::<Deployment>(namespace, name).await,
            SeedKind::StatefulSet => self.delete_object::<StatefulSet>(namespace, name).await,
            SeedKind::ManagedResource => {
                self.delete_object::<ManagedResource>(namespace, name).await
            }
        }
    }

    async fn patch_persistent_volume(&self, name: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &merge(patch)).await?;
        Ok(())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Run the seed-side routines in order
pub async fn run_seed_maintenance(
    seed: &dyn SeedObjects,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    info!("Cleaning up legacy resource-manager finalizers");
    grm_finalizers::cleanup_legacy_finalizers(seed, cancel).await?;

    info!("Pointing shoot Prometheus at the cache Prometheus and seed Alertmanager");
    prometheus_config::update_shoot_prometheus(seed, cancel).await?;

    info!("Migrating dependency-watchdog probe access");
    dwd_access::migrate_probe_access(seed, cancel).await?;

    info!("Deleting legacy shoot-core ManagedResources");
    shoot_core::delete_legacy_shoot_core(seed, cancel).await?;

    info!("Labelling persistent volumes in disk migration");
    pv_labels::label_migrating_volumes(seed, cancel).await?;

    Ok(())
}
