//! Reflector-backed stores for one kind

use std::any::Any;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, StreamExt};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kind::CachedKind;
use crate::topology::CacheStrategy;
use seedlet_common::Error;

/// Start a watch for `api` and reflect it into a store until `cancel` fires
pub(crate) fn spawn_reflector<K: CachedKind>(
    api: kube::Api<K>,
    config: watcher::Config,
    cancel: CancellationToken,
) -> Store<K> {
    let (reader, writer) = reflector::store::<K>();
    let kind = K::kind_name();
    let stream = reflector::reflector(writer, watcher(api, config)).default_backoff();

    tokio::spawn(async move {
        let drain = stream.for_each(|event| {
            if let Err(e) = event {
                warn!(kind = %kind, error = %e, "Watch error, backing off");
            }
            futures::future::ready(())
        });
        tokio::select! {
            _ = cancel.cancelled() => debug!(kind = %kind, "Watch stopped"),
            _ = drain => {}
        }
    });

    reader
}

/// All stores backing one kind's multi-object informer
pub(crate) struct KindStores<K: CachedKind> {
    stores: Vec<(Option<String>, Store<K>)>,
}

impl<K: CachedKind> KindStores<K> {
    /// Start watches for `strategy`
    pub(crate) fn start(
        client: &Client,
        strategy: &CacheStrategy,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let stores = match strategy {
            CacheStrategy::ClusterWide { selector } => {
                let api = K::api(client.clone(), None);
                vec![(
                    None,
                    spawn_reflector(api, selector.watcher_config(), cancel.child_token()),
                )]
            }
            CacheStrategy::NamespaceScoped { namespaces } => namespaces
                .iter()
                .map(|ns| {
                    let api = K::api(client.clone(), Some(ns));
                    let store = spawn_reflector(
                        api,
                        watcher::Config::default(),
                        cancel.child_token(),
                    );
                    (Some(ns.clone()), store)
                })
                .collect(),
            CacheStrategy::SingleObject | CacheStrategy::FallbackOnly => {
                return Err(Error::cache(
                    K::kind_name(),
                    "kind has no multi-object informer",
                ))
            }
        };
        Ok(Self { stores })
    }

    /// Resolves once every store has completed its initial list
    pub(crate) fn ready(&self) -> BoxFuture<'static, ()> {
        let stores: Vec<Store<K>> = self.stores.iter().map(|(_, s)| s.clone()).collect();
        async move {
            join_all(stores.iter().map(|s| s.wait_until_ready())).await;
        }
        .boxed()
    }

    pub(crate) fn get(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let mut key = ObjectRef::<K>::new(name);
        if let Some(ns) = namespace {
            key = key.within(ns);
        }
        self.stores
            .iter()
            .filter(|(scope, _)| scope.is_none() || scope.as_deref() == namespace)
            .find_map(|(_, store)| store.get(&key))
            .map(|obj| (*obj).clone())
    }

    pub(crate) fn list(&self, namespace: Option<&str>) -> Vec<K> {
        self.stores
            .iter()
            .filter(|(scope, _)| {
                namespace.is_none() || scope.is_none() || scope.as_deref() == namespace
            })

            .flat_map(|(_, store)| store.state())
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .map(|obj| (*obj).clone())
            .collect()
    }
}

/// Type-erased handle kept in the client's informer registry
#[derive(Clone)]
pub(crate) struct InformerHandle {
    pub(crate) kind: String,
    pub(crate) ready: Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    pub(crate) stores: Arc<dyn Any + Send + Sync>,
}

impl InformerHandle {
    pub(crate) fn new<K: CachedKind>(stores: KindStores<K>) -> Self {
        let stores = Arc::new(stores);
        let for_ready = Arc::clone(&stores);
        Self {
            kind: K::kind_name(),
            ready: Arc::new(move || for_ready.ready()),
            stores,
        }
    }

    pub(crate) fn downcast<K: CachedKind>(&self) -> Result<Arc<KindStores<K>>, Error> {
        Arc::clone(&self.stores)
            .downcast::<KindStores<K>>()
            .map_err(|_| Error::internal_with_context("cache", "informer registry type mismatch"))
    }
}
