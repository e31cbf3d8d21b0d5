//! Cache topology: which kinds are watched, how, and which reads bypass the cache
//!
//! The topology is resolved once at startup and never changes afterwards.
//! Routing is a pure function of (kind, namespace).

use std::collections::{BTreeMap, BTreeSet};

use kube::runtime::watcher;
use seedlet_common::{seed_namespace, seed_shoot_label, Error};

/// Label and field selectors restricting a cluster-wide watch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    /// Label selector, e.g. `name.seed.seedlet.dev/aws-eu1=true`
    pub labels: Option<String>,
    /// Field selector, e.g. `spec.seedName=aws-eu1`
    pub fields: Option<String>,
}

impl Selector {
    /// Watch every object of the kind
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict by label selector
    pub fn labels(selector: impl Into<String>) -> Self {
        Self {
            labels: Some(selector.into()),
            fields: None,
        }
    }

    /// Restrict by field selector
    pub fn fields(selector: impl Into<String>) -> Self {
        Self {
            labels: None,
            fields: Some(selector.into()),
        }
    }

    /// Watcher configuration carrying this selector
    pub fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(labels) = &self.labels {
            cfg = cfg.labels(labels);
        }
        if let Some(fields) = &self.fields {
            cfg = cfg.fields(fields);
        }
        cfg
    }
}

/// How one kind is cached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheStrategy {
    /// One watch across all namespaces, optionally filtered
    ClusterWide {
        /// Restriction applied server-side
        selector: Selector,
    },
    /// One watch per allowed namespace
    NamespaceScoped {
        /// Namespaces that may be watched
        namespaces: BTreeSet<String>,
    },
    /// No list/watch privilege; each object gets its own name-scoped watch on first read
    SingleObject,
    /// Never cached; every read goes to the API server
    FallbackOnly,
}

/// Reads of `kind` outside `cached_namespaces` go straight to the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackRoute {
    /// Kind name, e.g. "Secret"
    pub kind: String,
    /// Namespaces served from the cache
    pub cached_namespaces: BTreeSet<String>,
}

/// What to do with kinds that have no rule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnscopedKinds {
    /// Watch them cluster-wide without restriction
    #[default]
    WatchClusterWide,
    /// Refuse to serve them
    Reject,
}

/// Where a read is served from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadRoute {
    /// Direct call to the API server
    Uncached,
    /// Dedicated per-object watch
    SingleObject,
    /// Shared multi-object informer
    Informer,
}

/// Immutable kind → strategy registry
#[derive(Clone, Debug)]
pub struct CacheTopology {
    rules: BTreeMap<String, CacheStrategy>,
    fallbacks: BTreeMap<String, BTreeSet<String>>,
    unscoped: UnscopedKinds,
}

impl CacheTopology {
    /// Start building a topology
    pub fn builder() -> CacheTopologyBuilder {
        CacheTopologyBuilder::default()
    }

    /// Strategy used to watch `kind`
    ///
    /// Kinds without a rule get an unrestricted cluster-wide watch, or a
    /// configuration error under [`UnscopedKinds::Reject`].
    pub fn strategy(&self, kind: &str) -> Result<CacheStrategy, Error> {
        match self.rules.get(kind) {
            Some(strategy) => Ok(strategy.clone()),
            None => match self.unscoped {
                UnscopedKinds::WatchClusterWide => Ok(CacheStrategy::ClusterWide {
                    selector: Selector::all(),
                }),
                UnscopedKinds::Reject => Err(Error::cache(
                    kind,
                    "no cache rule configured and unscoped kinds are rejected",
                )),
            },
        }
    }

    /// Route a point read of `kind` in `namespace`
    pub fn route(&self, kind: &str, namespace: Option<&str>) -> Result<ReadRoute, Error> {
        if self.bypasses_cache(kind, namespace) {
            return Ok(ReadRoute::Uncached);
        }
        match self.strategy(kind)? {
            CacheStrategy::FallbackOnly => Ok(ReadRoute::Uncached),
            CacheStrategy::SingleObject => Ok(ReadRoute::SingleObject),
            CacheStrategy::ClusterWide { .. } => Ok(ReadRoute::Informer),
            CacheStrategy::NamespaceScoped { namespaces } => match namespace {
                Some(ns) if namespaces.contains(ns) => Ok(ReadRoute::Informer),
                other => Err(Error::cache(
                    kind,
                    format!(
                        "namespace {:?} is outside the cached namespaces and has no fallback route",
                        other
                    ),
                )),
            },
        }
    }

    /// Route a list of `kind`, optionally restricted to `namespace`
    pub fn list_route(&self, kind: &str, namespace: Option<&str>) -> Result<ReadRoute, Error> {
        if self.bypasses_cache(kind, namespace) {
            return Ok(ReadRoute::Uncached);
        }
        match self.strategy(kind)? {
            CacheStrategy::SingleObject => Err(Error::cache(
                kind,
                "cannot list a single-object kind; read objects by name",
            )),
            CacheStrategy::FallbackOnly => Ok(ReadRoute::Uncached),
            CacheStrategy::ClusterWide { .. } => Ok(ReadRoute::Informer),
            CacheStrategy::NamespaceScoped { namespaces } => match namespace {
                None => Ok(ReadRoute::Informer),
                Some(ns) if namespaces.contains(ns) => Ok(ReadRoute::Informer),
                Some(ns) => Err(Error::cache(
                    kind,
                    format!("namespace {ns} is outside the cached namespaces"),
                )),
            },
        }
    }

    /// Kinds with an explicit rule
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    fn bypasses_cache(&self, kind: &str, namespace: Option<&str>) -> bool {
        match (self.fallbacks.get(kind), namespace) {
            (Some(cached), Some(ns)) => !cached.contains(ns),
            _ => false,
        }
    }
}

/// Builder for [`CacheTopology`]
#[derive(Default)]
pub struct CacheTopologyBuilder {
    rules: Vec<(String, CacheStrategy)>,
    fallbacks: Vec<FallbackRoute>,
    unscoped: UnscopedKinds,
}

impl CacheTopologyBuilder {
    /// Add a rule for `kind`
    pub fn rule(mut self, kind: impl Into<String>, strategy: CacheStrategy) -> Self {
        self.rules.push((kind.into(), strategy));
        self
    }

    /// Mark several kinds as single-object
    pub fn single_object<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for kind in kinds {
            self.rules.push((kind.into(), CacheStrategy::SingleObject));
        }
        self
    }

    /// Add a fallback route
    pub fn fallback(mut self, route: FallbackRoute) -> Self {
        self.fallbacks.push(route);
        self
    }

    /// Behaviour for kinds without a rule
    pub fn unscoped(mut self, unscoped: UnscopedKinds) -> Self {
        self.unscoped = unscoped;
        self
    }

    /// Validate and freeze the topology
    pub fn build(self) -> Result<CacheTopology, Error> {
        let mut rules = BTreeMap::new();
        for (kind, strategy) in self.rules {
            if let CacheStrategy::NamespaceScoped { namespaces } = &strategy {
                if namespaces.is_empty() {
                    return Err(Error::cache(&kind, "namespace-scoped rule without namespaces"));
                }
            }
            if rules.insert(kind.clone(), strategy).is_some() {
                return Err(Error::cache(&kind, "more than one cache rule"));
            }
        }

        let mut fallbacks = BTreeMap::new();
        for route in self.fallbacks {
            match rules.get(&route.kind) {
                Some(CacheStrategy::NamespaceScoped { namespaces }) => {
                    if !route.cached_namespaces.is_subset(namespaces) {
                        return Err(Error::cache(
                            &route.kind,
                            "fallback route claims namespaces the cache does not watch",
                        ));
                    }
                }
                Some(_) => {
                    return Err(Error::cache(
                        &route.kind,
                        "fallback routes only apply to namespace-scoped kinds",
                    ))
                }
                None => {
                    return Err(Error::cache(
                        &route.kind,
                        "fallback route for a kind without a cache rule",
                    ))
                }
            }
            if fallbacks
                .insert(route.kind.clone(), route.cached_namespaces)
                .is_some()
            {
                return Err(Error::cache(&route.kind, "more than one fallback route"));
            }
        }

        Ok(CacheTopology {
            rules,
            fallbacks,
            unscoped: self.unscoped,
        })
    }
}

/// Kinds the agent reads only by name from the garden
pub const GARDEN_SINGLE_OBJECT_KINDS: &[&str] = &[
    "ConfigMap",
    "Namespace",
    "Lease",
    "CertificateSigningRequest",
    "CloudProfile",
    "ControllerDeployment",
    "ExposureClass",
    "InternalSecret",
    "Project",
    "SecretBinding",
    "ShootState",
];

/// The agent's view of the garden cluster for `seed`
pub fn garden_topology(seed: &str) -> Result<CacheTopology, Error> {
    let seed_ns: BTreeSet<String> = [seed_namespace(seed)].into_iter().collect();

    let mut builder = CacheTopology::builder()
        .rule(
            "Seed",
            CacheStrategy::ClusterWide {
                selector: Selector::fields(format!("metadata.name={seed}")),
            },
        )
        .rule(
            "ControllerInstallation",
            CacheStrategy::ClusterWide {
                selector: Selector::fields(format!("spec.seedRef.name={seed}")),
            },
        )
        .rule(
            "Shoot",
            CacheStrategy::ClusterWide {
                selector: Selector::labels(format!("{}=true", seed_shoot_label(seed))),
            },
        )
        .rule(
            "Bastion",
            CacheStrategy::ClusterWide {
                selector: Selector::fields(format!("spec.seedName={seed}")),
            },
        )
        .rule("Event", CacheStrategy::FallbackOnly)
        .single_object(GARDEN_SINGLE_OBJECT_KINDS.iter().copied());

    for kind in ["Secret", "ServiceAccount"] {
        builder = builder
            .rule(
                kind,
                CacheStrategy::NamespaceScoped {
                    namespaces: seed_ns.clone(),
                },
            )
            .fallback(FallbackRoute {
                kind: kind.to_string(),
                cached_namespaces: seed_ns.clone(),
            });
    }

    builder.build()
}
