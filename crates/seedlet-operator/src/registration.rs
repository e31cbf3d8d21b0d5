//! Seed registration in the garden
//!
//! The Seed is created if missing, otherwise merge-patched: labels and
//! annotations from the configuration are unioned over whatever is already
//! there and `spec` is replaced. Afterwards the seed namespace, created by
//! the garden's controller manager, must become visible.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seedlet_cache::ScopedClient;
use seedlet_common::config::SeedTemplate;
use seedlet_common::crd::Seed;
use seedlet_common::kube_utils::{create_merge_patch, is_empty_patch, merge_string_maps, poll_until};
use seedlet_common::{seed_namespace, Error, ROLE_LABEL, ROLE_SEED};

/// Interval between seed namespace checks
pub const NAMESPACE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long the seed namespace may take to appear
pub const NAMESPACE_TIMEOUT: Duration = Duration::from_secs(5);

/// Garden access needed to register a seed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeedRegistry: Send + Sync {
    /// The Seed, if it exists
    async fn get_seed(&self, name: &str) -> Result<Option<Seed>, Error>;
    /// Create the Seed
    async fn create_seed(&self, seed: &Seed) -> Result<Seed, Error>;
    /// Apply a merge patch to the Seed
    async fn patch_seed(&self, name: &str, patch: &Value) -> Result<Seed, Error>;
    /// Whether the namespace is readable; RBAC denials surface as errors
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;
}

/// [`SeedRegistry`] over the scoped garden client
pub struct ScopedSeedRegistry {
    client: ScopedClient,
}

impl ScopedSeedRegistry {
    /// Wrap the garden client
    pub fn new(client: ScopedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SeedRegistry for ScopedSeedRegistry {
    async fn get_seed(&self, name: &str) -> Result<Option<Seed>, Error> {
        if let Some(seed) = self.client.get::<Seed>(None, name).await? {
            return Ok(Some(seed));
        }
        // a cache miss may just be lag; confirm before creating
        self.client.get_direct::<Seed>(None, name).await
    }

    async fn create_seed(&self, seed: &Seed) -> Result<Seed, Error> {
        self.client.create(seed).await
    }

    async fn patch_seed(&self, name: &str, patch: &Value) -> Result<Seed, Error> {
        self.client.merge_patch::<Seed>(None, name, patch).await
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        // direct read so a 403 is reported as such instead of stalling a watch
        Ok(self.client.get_direct::<Namespace>(None, name).await?.is_some())
    }
}

/// Timing of the seed namespace wait
#[derive(Debug, Clone, Copy)]
pub struct NamespaceWait {
    /// Interval between checks
    pub interval: Duration,
    /// Overall bound
    pub timeout: Duration,
}

impl Default for NamespaceWait {
    fn default() -> Self {
        Self {
            interval: NAMESPACE_POLL_INTERVAL,
            timeout: NAMESPACE_TIMEOUT,
        }
    }
}

/// Labels the agent owns on its Seed
pub fn desired_labels(template: &SeedTemplate) -> BTreeMap<String, String> {
    let role = BTreeMap::from([(ROLE_LABEL.to_string(), ROLE_SEED.to_string())]);
    merge_string_maps(Some(&role), Some(&template.metadata.labels)).unwrap_or_default()
}

/// `existing` with the template's metadata unioned in and its spec replaced
pub fn desired_seed(existing: &Seed, template: &SeedTemplate) -> Seed {
    let mut seed = existing.clone();
    let labels = desired_labels(template);
    seed.metadata.labels = merge_string_maps(existing.metadata.labels.as_ref(), Some(&labels));
    if !template.metadata.annotations.is_empty() {
        seed.metadata.annotations = merge_string_maps(
            existing.metadata.annotations.as_ref(),
            Some(&template.metadata.annotations),
        );
    }
    seed.spec = template.spec.clone();
    seed
}

fn new_seed(template: &SeedTemplate) -> Seed {
    let annotations = &template.metadata.annotations;
    Seed {
        metadata: ObjectMeta {
            name: Some(template.metadata.name.clone()),
            labels: Some(desired_labels(template)),
            annotations: (!annotations.is_empty()).then(|| annotations.clone()),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

/// Create or merge-patch the Seed, then wait for its garden namespace
pub async fn register_seed(
    registry: &dyn SeedRegistry,
    template: &SeedTemplate,
    wait: NamespaceWait,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let name = template.metadata.name.as_str();

    let existing = match registry.get_seed(name).await? {
        Some(seed) => Some(seed),
        None => match registry.create_seed(&new_seed(template)).await {
            Ok(_) => {
                info!(seed = %name, "Created Seed");
                None
            }
            Err(e) if e.is_already_exists() => {
                debug!(seed = %name, "Seed appeared concurrently, patching instead");
                Some(registry.get_seed(name).await?.ok_or_else(|| {
                    Error::registration(name, "seed reported as existing but could not be read")
                })?)
            }
            Err(e) => return Err(e),
        },
    };

    if let Some(existing) = existing {
        patch_seed(registry, &existing, template).await?;
    }

    wait_for_seed_namespace(registry, name, wait, cancel).await
}

async fn patch_seed(
    registry: &dyn SeedRegistry,
    existing: &Seed,
    template: &SeedTemplate,
) -> Result<(), Error> {
    let name = template.metadata.name.as_str();
    let original = to_value(existing)?;
    let modified = to_value(&desired_seed(existing, template))?;
    let patch = create_merge_patch(&original, &modified);
    if is_empty_patch(&patch) {
        debug!(seed = %name, "Seed already up to date");
        return Ok(());
    }
    registry.patch_seed(name, &patch).await?;
    info!(seed = %name, "Updated Seed");
    Ok(())
}

fn to_value(seed: &Seed) -> Result<Value, Error> {
    serde_json::to_value(seed).map_err(|e| Error::serialization_for_kind("Seed", e.to_string()))
}

async fn wait_for_seed_namespace(
    registry: &dyn SeedRegistry,
    seed: &str,
    wait: NamespaceWait,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let owned = seed_namespace(seed);
    let namespace = owned.as_str();
    let result = poll_until(
        cancel,
        wait.timeout,
        wait.interval,
        format!("namespace {namespace} not visible within {:?}", wait.timeout),
        || async move {
            match registry.namespace_exists(namespace).await {
                Ok(exists) => Ok(exists),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) if e.is_forbidden() => {
                    // also what a broken RBAC setup looks like; only the timeout tells them apart
                    warn!(namespace = %namespace, "Seed namespace not readable yet (forbidden)");
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        },
    )
    .await;

    match result {
        Ok(()) => {
            info!(namespace = %namespace, "Seed namespace is visible");
            Ok(())
        }
        Err(Error::Internal { message, .. }) => Err(Error::registration(seed, message)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use seedlet_common::crd::{SeedNetworks, SeedProvider, SeedSpec};
    use seedlet_common::error::api_error;

    fn fast() -> NamespaceWait {
        NamespaceWait {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(100),
        }
    }

    fn template(labels: &[(&str, &str)]) -> SeedTemplate {
        let mut t = SeedTemplate::default();
        t.metadata.name = "seed-a".to_string();
        t.metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        t.spec = SeedSpec {
            provider: SeedProvider {
                provider_type: "aws".to_string(),
                region: "eu-west-1".to_string(),
                zones: Vec::new(),
            },
            networks: SeedNetworks {
                nodes: None,
                pods: "100.96.0.0/11".to_string(),
                services: "100.64.0.0/13".to_string(),
                shoot_defaults: None,
            },
            ..Default::default()
        };
        t
    }

    /// In-memory garden applying merge patches like the API server does
    #[derive(Default)]
    struct FakeGarden {
        seed: Mutex<Option<Value>>,
        creates: AtomicUsize,
        patches: AtomicUsize,
    }

    impl FakeGarden {
        fn with_seed(seed: Seed) -> Self {
            let garden = Self::default();
            *garden.seed.lock().unwrap() = Some(serde_json::to_value(seed).unwrap());
            garden
        }

        fn seed(&self) -> Seed {
            serde_json::from_value(self.seed.lock().unwrap().clone().unwrap()).unwrap()
        }
    }

    #[async_trait]
    impl SeedRegistry for FakeGarden {
        async fn get_seed(&self, _name: &str) -> Result<Option<Seed>, Error> {
            Ok(self
                .seed
                .lock()
                .unwrap()
                .clone()
                .map(|v| serde_json::from_value(v).unwrap()))
        }

        async fn create_seed(&self, seed: &Seed) -> Result<Seed, Error> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            *self.seed.lock().unwrap() = Some(serde_json::to_value(seed).unwrap());
            Ok(seed.clone())
        }

        async fn patch_seed(&self, _name: &str, patch: &Value) -> Result<Seed, Error> {
            self.patches.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.seed.lock().unwrap();
            let doc = guard.as_mut().unwrap();
            json_patch::merge(doc, patch);
            Ok(serde_json::from_value(doc.clone()).unwrap())
        }

        async fn namespace_exists(&self, _name: &str) -> Result<bool, Error> {
            Ok(true)
        }
    }

    fn foreign_seed() -> Seed {
        let mut seed = new_seed(&template(&[]));
        let owner = ("owner".to_string(), "platform".to_string());
        let note = ("note".to_string(), "keep".to_string());
        seed.metadata.labels = Some(BTreeMap::from([owner]));
        seed.metadata.annotations = Some(BTreeMap::from([note]));


        seed.spec.provider.region = "us-east-1".to_string();
        seed
    }

    #[tokio::test]
    async fn story_labels_are_unioned_with_foreign_labels() {
        let garden = FakeGarden::with_seed(foreign_seed());
        let cancel = CancellationToken::new();

        register_seed(&garden, &template(&[("team", "x")]), fast(), &cancel)
            .await
            .unwrap();

        let labels = garden.seed().metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("x"));
        assert_eq!(labels.get("owner").map(String::as_str), Some("platform"));
        assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some(ROLE_SEED));
    }

    #[tokio::test]
    async fn story_registration_is_idempotent() {
        let garden = FakeGarden::with_seed(foreign_seed());
        let cancel = CancellationToken::new();
        let t = template(&[("team", "x")]);

        register_seed(&garden, &t, fast(), &cancel).await.unwrap();
        let first = garden.seed();
        register_seed(&garden, &t, fast(), &cancel).await.unwrap();
        let second = garden.seed();

        assert_eq!(first, second);
        // the second run computed an empty patch and sent nothing
        assert_eq!(garden.patches.load(Ordering::SeqCst), 1);
        assert_eq!(
            second.metadata.annotations.unwrap().get("note").map(String::as_str),
            Some("keep")
        );
        assert_eq!(second.spec, t.spec);
    }

    #[tokio::test]
    async fn spec_is_replaced_wholesale() {
        let garden = FakeGarden::with_seed(foreign_seed());
        register_seed(&garden, &template(&[]), fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(garden.seed().spec.provider.region, "eu-west-1");
    }

    #[tokio::test]
    async fn missing_seed_is_created() {
        let garden = FakeGarden::default();
        register_seed(&garden, &template(&[("team", "x")]), fast(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(garden.creates.load(Ordering::SeqCst), 1);
        assert_eq!(garden.patches.load(Ordering::SeqCst), 0);
        assert_eq!(garden.seed().metadata.name.as_deref(), Some("seed-a"));
    }

    #[tokio::test]
    async fn concurrent_create_falls_back_to_patch() {
        let mut registry = MockSeedRegistry::new();
        let reads = Arc::new(AtomicUsize::new(0));
        let r = reads.clone();
        registry.expect_get_seed().times(2).returning(move |_| {
            if r.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(foreign_seed()))
            }
        });
        registry
            .expect_create_seed()
            .times(1)
            .returning(|_| Err(api_error(409, "AlreadyExists").into()));
        registry
            .expect_patch_seed()
            .times(1)
            .returning(|_, _| Ok(foreign_seed()));
        registry.expect_namespace_exists().returning(|_| Ok(true));

        register_seed(&registry, &template(&[]), fast(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forbidden_and_not_found_mean_not_yet() {
        let mut registry = MockSeedRegistry::new();
        registry
            .expect_get_seed()
            .returning(|_| Ok(Some(new_seed(&template(&[])))));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry
            .expect_namespace_exists()
            .withf(|ns| ns.to_string() == "seed-seed-a")
            .returning(move |_| match c.fetch_add(1, Ordering::SeqCst) {
                0 => Err(api_error(403, "Forbidden").into()),
                1 => Err(api_error(404, "NotFound").into()),
                2 => Ok(false),
                _ => Ok(true),
            });

        register_seed(&registry, &template(&[]), fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn namespace_timeout_is_a_registration_error() {
        let mut registry = MockSeedRegistry::new();
        registry
            .expect_get_seed()
            .returning(|_| Ok(Some(new_seed(&template(&[])))));
        registry
            .expect_namespace_exists()
            .returning(|_| Err(api_error(403, "Forbidden").into()));

        let err = register_seed(&registry, &template(&[]), fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registration { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn other_namespace_errors_are_fatal_immediately() {
        let mut registry = MockSeedRegistry::new();
        registry
            .expect_get_seed()
            .returning(|_| Ok(Some(new_seed(&template(&[])))));
        registry
            .expect_namespace_exists()
            .times(1)
            .returning(|_| Err(api_error(500, "InternalError").into()));

        let err = register_seed(&registry, &template(&[]), fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube { .. }), "{err:?}");
    }
}
