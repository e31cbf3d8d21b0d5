//! Scoped client: cached reads routed by topology, direct writes

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::informer::{spawn_reflector, InformerHandle, KindStores};
use crate::kind::CachedKind;
use crate::sync::SyncStatus;
use crate::topology::{CacheTopology, ReadRoute};
use seedlet_common::metrics::CACHE_SYNC_DURATION;
use seedlet_common::Error;

/// Default bound for any single cache sync wait
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

type SingleKey = (TypeId, Option<String>, String);

/// Client whose reads follow a [`CacheTopology`]
///
/// Cheap to clone; clones share caches and the sync flag.
#[derive(Clone)]
pub struct ScopedClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    topology: CacheTopology,
    informers: DashMap<TypeId, InformerHandle>,
    single: DashMap<SingleKey, Arc<dyn Any + Send + Sync>>,
    sync: SyncStatus,
    cancel: CancellationToken,
    sync_timeout: Duration,
}

impl ScopedClient {
    /// Create a client; watches stop when `cancel` fires
    pub fn new(client: Client, topology: CacheTopology, cancel: CancellationToken) -> Self {
        Self::with_sync_timeout(client, topology, cancel, DEFAULT_SYNC_TIMEOUT)
    }

    /// Create a client with a custom bound for lazy sync waits
    pub fn with_sync_timeout(
        client: Client,
        topology: CacheTopology,
        cancel: CancellationToken,
        sync_timeout: Duration,
    ) -> Self {
        Self::with_sync_status(client, topology, cancel, sync_timeout, SyncStatus::default())
    }

    /// Create a client that reports sync through an existing flag
    ///
    /// Lets a readiness probe started before the client observe its sync.
    pub fn with_sync_status(
        client: Client,
        topology: CacheTopology,
        cancel: CancellationToken,
        sync_timeout: Duration,
        sync: SyncStatus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                topology,
                informers: DashMap::new(),
                single: DashMap::new(),
                sync,
                cancel,
                sync_timeout,
            }),
        }
    }

    /// Underlying uncached client
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Topology in effect
    pub fn topology(&self) -> &CacheTopology {
        &self.inner.topology
    }

    /// Shared sync flag for readiness reporting
    pub fn sync_status(&self) -> SyncStatus {
        self.inner.sync.clone()
    }

    /// Start the multi-object informer for `K` ahead of the first read
    pub fn start<K: CachedKind>(&self) -> Result<(), Error> {
        self.informer::<K>().map(|_| ())
    }

    /// Wait until every started informer has listed its objects
    ///
    /// Fails with [`Error::CacheSync`] naming the kinds still pending.
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> Result<(), Error> {
        let started = std::time::Instant::now();
        let handles: Vec<InformerHandle> = self
            .inner
            .informers
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let results = join_all(handles.iter().map(|h| async move {
            let synced = tokio::time::timeout(timeout, (h.ready)()).await.is_ok();
            (h.kind.clone(), synced)
        }))
        .await;

        let mut pending: Vec<String> = results
            .into_iter()
            .filter(|(_, synced)| !synced)
            .map(|(kind, _)| kind)
            .collect();
        if !pending.is_empty() {
            pending.sort();
            return Err(Error::cache_sync(
                format!("caches not synced within {:?}", timeout),
                pending,
            ));
        }

        CACHE_SYNC_DURATION.record(started.elapsed().as_secs_f64(), &[]);
        self.inner.sync.mark_synced();
        info!(informers = handles.len(), "Caches synced");
        Ok(())
    }

    /// Read one object, routed by the topology
    pub async fn get<K: CachedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, Error> {
        match self.inner.topology.route(&K::kind_name(), namespace)? {
            ReadRoute::Uncached => self.get_direct(namespace, name).await,
            ReadRoute::SingleObject => self.get_single(namespace, name).await,
            ReadRoute::Informer => {
                let stores = self.informer::<K>()?;
                self.await_ready(&K::kind_name(), stores.ready()).await?;
                Ok(stores.get(namespace, name))
            }
        }
    }

    /// Read one object straight from the API server
    pub async fn get_direct<K: CachedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, Error> {
        Ok(K::api(self.inner.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }

    /// List objects, optionally in one namespace
    pub async fn list<K: CachedKind>(&self, namespace: Option<&str>) -> Result<Vec<K>, Error> {
        match self.inner.topology.list_route(&K::kind_name(), namespace)? {
            ReadRoute::Informer => {
                let stores = self.informer::<K>()?;
                self.await_ready(&K::kind_name(), stores.ready()).await?;
                Ok(stores.list(namespace))
            }
            _ => Ok(K::api(self.inner.client.clone(), namespace)
                .list(&ListParams::default())
                .await?
                .items),
        }
    }

    /// Create an object in its own namespace
    pub async fn create<K: CachedKind>(&self, obj: &K) -> Result<K, Error> {
        let ns = obj.namespace();
        Ok(K::api(self.inner.client.clone(), ns.as_deref())
            .create(&PostParams::default(), obj)
            .await?)
    }

    /// Apply an RFC 7386 merge patch
    pub async fn merge_patch<K: CachedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, Error> {
        Ok(K::api(self.inner.client.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    /// Apply an RFC 7386 merge patch to the status subresource
    pub async fn merge_patch_status<K: CachedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, Error> {
        Ok(K::api(self.inner.client.clone(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    /// Replace an object, guarded by the resourceVersion it carries
    pub async fn replace<K: CachedKind>(&self, obj: &K) -> Result<K, Error> {
        let ns = obj.namespace();
        Ok(K::api(self.inner.client.clone(), ns.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    /// Delete an object
    pub async fn delete<K: CachedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error> {
        K::api(self.inner.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    fn informer<K: CachedKind>(&self) -> Result<Arc<KindStores<K>>, Error> {
        let type_id = TypeId::of::<K>();
        if let Some(handle) = self.inner.informers.get(&type_id) {
            return handle.downcast::<K>();
        }

        let strategy = self.inner.topology.strategy(&K::kind_name())?;
        let handle = self
            .inner
            .informers
            .entry(type_id)
            .or_try_insert_with(|| {
                debug!(kind = %K::kind_name(), ?strategy, "Starting informer");
                KindStores::<K>::start(&self.inner.client, &strategy, &self.inner.cancel)
                    .map(InformerHandle::new)
            })?
            .clone();
        handle.downcast::<K>()
    }

    async fn get_single<K: CachedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, Error> {
        let key: SingleKey = (
            TypeId::of::<K>(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        let erased = self
            .inner
            .single
            .entry(key)
            .or_insert_with(|| {
                debug!(kind = %K::kind_name(), ?namespace, name, "Starting single-object watch");
                let api = K::api(self.inner.client.clone(), namespace);
                let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
                let store: Store<K> = spawn_reflector(api, config, self.inner.cancel.child_token());
                Arc::new(store) as Arc<dyn Any + Send + Sync>
            })
            .clone();
        let store = erased.downcast::<Store<K>>().map_err(|_| {
            Error::internal_with_context("cache", "single-object registry type mismatch")
        })?;

        let label = format!("{}/{}", K::kind_name(), name);
        let ready = store.clone();
        self.await_ready(&label, async move {
            let _ = ready.wait_until_ready().await;
        })
        .await?;

        let mut key = ObjectRef::<K>::new(name);
        if let Some(ns) = namespace {
            key = key.within(ns);
        }
        Ok(store.get(&key).map(|obj| (*obj).clone()))
    }

    async fn await_ready(
        &self,
        what: &str,
        ready: impl std::future::Future<Output = ()>,
    ) -> Result<(), Error> {
        tokio::time::timeout(self.inner.sync_timeout, ready)
            .await
            .map_err(|_| {
                Error::cache_sync(
                    format!("cache not synced within {:?}", self.inner.sync_timeout),
                    vec![what.to_string()],
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::convert::Infallible;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::client::Body;
    use serde_json::json;

    use crate::topology::{CacheStrategy, FallbackRoute, Selector};

    /// Fake API server: records every request, answers lists and gets,
    /// and keeps watches open forever
    fn fake_client(
        respond: fn(&str) -> Option<(u16, Value)>,
    ) -> (Client, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let svc = tower::service_fn(move |req: http::Request<Body>| {
            let uri = req.uri().to_string();
            log.lock().unwrap().push(uri.clone());
            async move {
                if uri.contains("watch=true") {
                    futures::future::pending::<()>().await;
                }
                let (status, body) = respond(&uri).unwrap_or((
                    404,
                    json!({"kind": "Status", "apiVersion": "v1", "status": "Failure",
                           "reason": "NotFound", "code": 404, "message": "not found"}),
                ));
                let body = serde_json::to_vec(&body).unwrap();
                Ok::<_, Infallible>(
                    http::Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
            }
        });
        (Client::new(svc, "default"), seen)
    }

    fn configmap_list(uri: &str) -> Option<(u16, Value)> {
        if uri.starts_with("/api/v1/namespaces/garden/configmaps?") {
            return Some((
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMapList",
                    "metadata": {"resourceVersion": "7"},
                    "items": [{
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "metadata": {
                            "name": "cluster-identity",
                            "namespace": "garden",
                            "resourceVersion": "7"
                        },
                        "data": {"id": "garden-1"}
                    }]
                }),
            ));
        }
        if uri.starts_with("/api/v1/namespaces/other/secrets/pull-secret") {
            return Some((
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {"name": "pull-secret", "namespace": "other"}
                }),
            ));
        }
        None
    }

    fn topology() -> CacheTopology {
        let seed_ns: BTreeSet<String> = ["seed-aws".to_string()].into_iter().collect();
        CacheTopology::builder()
            .single_object(["ConfigMap"])
            .rule(
                "Secret",
                CacheStrategy::NamespaceScoped {
                    namespaces: seed_ns.clone(),
                },
            )
            .fallback(FallbackRoute {
                kind: "Secret".to_string(),
                cached_namespaces: seed_ns,
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn single_object_reads_never_list_cluster_wide() {
        let (client, seen) = fake_client(configmap_list);
        let scoped = ScopedClient::new(client, topology(), CancellationToken::new());

        let cm: Option<ConfigMap> = scoped.get(Some("garden"), "cluster-identity").await.unwrap();
        let cm = cm.unwrap();
        assert_eq!(
            cm.data.unwrap().get("id").map(String::as_str),
            Some("garden-1")
        );

        // second read is served from the same watch
        let again: Option<ConfigMap> =
            scoped.get(Some("garden"), "cluster-identity").await.unwrap();

        assert!(again.is_some());

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        for uri in seen.iter() {
            assert!(
                uri.starts_with("/api/v1/namespaces/garden/configmaps?"),
                "unexpected request {uri}"
            );
            assert!(uri.contains("metadata.name"), "missing name selector in {uri}");
        }
        let lists = seen.iter().filter(|u| !u.contains("watch=true")).count();
        assert_eq!(lists, 1, "one initial list for the object, then cache hits");
    }

    #[tokio::test]
    async fn listing_single_object_kind_is_refused_without_calls() {
        let (client, seen) = fake_client(configmap_list);
        let scoped = ScopedClient::new(client, topology(), CancellationToken::new());

        let err = scoped.list::<ConfigMap>(Some("garden")).await.unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fallback_reads_go_straight_to_the_api_server() {
        let (client, seen) = fake_client(configmap_list);
        let scoped = ScopedClient::new(client, topology(), CancellationToken::new());

        let secret: Option<Secret> = scoped.get(Some("other"), "pull-secret").await.unwrap();
        assert!(secret.is_some());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["/api/v1/namespaces/other/secrets/pull-secret"]
        );
    }

    #[tokio::test]
    async fn missing_object_via_fallback_is_none() {
        let (client, _) = fake_client(configmap_list);
        let scoped = ScopedClient::new(client, topology(), CancellationToken::new());

        let secret: Option<Secret> = scoped.get(Some("other"), "absent").await.unwrap();
        assert!(secret.is_none());
    }

    #[tokio::test]
    async fn sync_times_out_and_names_pending_kinds() {
        // Every list fails, so the informer never becomes ready
        fn failing(_: &str) -> Option<(u16, Value)> {
            Some((
                500,
                json!({"kind": "Status", "apiVersion": "v1", "status": "Failure",
                       "reason": "InternalError", "code": 500, "message": "boom"}),
            ))
        }
        let (client, _) = fake_client(failing);
        let scoped = ScopedClient::new(client, topology(), CancellationToken::new());
        scoped.start::<Secret>().unwrap();

        let err = scoped
            .wait_for_cache_sync(Duration::from_millis(200))
            .await
            .unwrap_err();
        match err {
            Error::CacheSync { pending, .. } => assert_eq!(pending, vec!["Secret"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!scoped.sync_status().is_synced());
    }

    #[tokio::test]
    async fn sync_succeeds_once_informers_listed() {
        fn secrets(uri: &str) -> Option<(u16, Value)> {
            uri.starts_with("/api/v1/namespaces/seed-aws/secrets?").then(|| {
                (
                    200,
                    json!({"apiVersion": "v1", "kind": "SecretList",
                           "metadata": {"resourceVersion": "1"}, "items": []}),
                )
            })
        }
        let (client, _) = fake_client(secrets);
        let scoped = ScopedClient::new(client, topology(), CancellationToken::new());
        scoped.start::<Secret>().unwrap();

        scoped
            .wait_for_cache_sync(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(scoped.sync_status().is_synced());

        let listed: Vec<Secret> = scoped.list(Some("seed-aws")).await.unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn selector_builds_watcher_config() {
        let cfg = Selector::labels("a=b").watcher_config();
        assert_eq!(cfg.label_selector.as_deref(), Some("a=b"));
        assert!(cfg.field_selector.is_none());
    }
}
