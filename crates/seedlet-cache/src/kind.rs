//! Scope-agnostic typed API construction

use std::fmt::Debug;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Builds an [`Api`] for a resource scope
pub trait ScopeApi {
    /// `namespace` is ignored for cluster-scoped kinds
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self>,
        <K as Resource>::DynamicType: Default;
}

impl ScopeApi for NamespaceResourceScope {
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self>,
        <K as Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl ScopeApi for ClusterResourceScope {
    fn api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self>,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(client)
    }
}

/// Any statically typed kind the scoped client can serve
pub trait CachedKind:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{

    /// Kind name used for topology lookups
    fn kind_name() -> String {
        Self::kind(&()).into_owned()
    }

    /// Api handle for `namespace` (all namespaces when `None`)
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

impl<K> CachedKind for K
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    K::Scope: ScopeApi,
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        <K::Scope as ScopeApi>::api::<K>(client, namespace)
    }
}
