//! Seed lease heartbeat
//!
//! Renews `Lease <seed>` in the garden every resync period. The outcome of
//! each renewal feeds [`PeriodicHealth`], so readiness drops once the garden
//! has been unreachable for longer than the grace window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seedlet_bootstrap::kubeconfig;
use seedlet_bootstrap::CredentialStore;
use seedlet_common::health::PeriodicHealth;
use seedlet_common::kube_utils::create_client_from_kubeconfig;
use seedlet_common::{Error, FIELD_MANAGER};

/// Garden namespace holding one lease per seed
pub const SEED_LEASE_NAMESPACE: &str = "seedlet-system-seed-lease";

/// Garden lease access
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeedLeaseApi: Send + Sync {
    /// The lease, if present
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error>;
    /// Create the lease
    async fn create(&self, lease: &Lease) -> Result<(), Error>;
    /// Merge-patch the lease
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>;
}

/// [`SeedLeaseApi`] that always talks with the newest garden credential
///
/// The client is rebuilt whenever the [`CredentialStore`] was swapped since
/// the last call.
pub struct GardenLeaseApi {
    store: CredentialStore,
    client: Mutex<Option<(Arc<Vec<u8>>, Client)>>,
}

impl GardenLeaseApi {
    /// Lease access through `store`'s credential
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Client, Error> {
        let current = self.store.current();
        let mut cached = self.client.lock().await;
        if let Some((seen, client)) = cached.as_ref() {
            if Arc::ptr_eq(seen, &current) {
                return Ok(client.clone());
            }
            info!("Garden credential changed, reconnecting heartbeat client");
        }
        let client = create_client_from_kubeconfig(kubeconfig::parse(&current)?).await?;
        *cached = Some((current, client.clone()));
        Ok(client)
    }
}

#[async_trait]
impl SeedLeaseApi for GardenLeaseApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error> {
        let api: Api<Lease> = Api::namespaced(self.client().await?, namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<(), Error> {
        let namespace = lease.metadata.namespace.as_deref().unwrap_or(SEED_LEASE_NAMESPACE);
        let api: Api<Lease> = Api::namespaced(self.client().await?, namespace);
        api.create(&PostParams::default(), lease).await?;
        Ok(())
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client().await?, namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// Lease body for `seed` renewed at `now`
pub fn seed_lease(seed: &str, now: DateTime<Utc>, duration: Duration) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(seed.to_string()),
            namespace: Some(SEED_LEASE_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(seed.to_string()),
            lease_duration_seconds: Some(i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }),
    }
}

/// Periodic renewal of the seed lease
pub struct SeedHeartbeat {
    api: Arc<dyn SeedLeaseApi>,
    health: PeriodicHealth,
    seed: String,
    resync: Duration,
}

impl SeedHeartbeat {
    /// Heartbeat for `seed` every `resync`
    pub fn new(
        api: Arc<dyn SeedLeaseApi>,
        health: PeriodicHealth,
        seed: impl Into<String>,
        resync: Duration,
    ) -> Self {
        Self {
            api,
            health,
            seed: seed.into(),
            resync,
        }
    }

    /// Renew once and record the outcome in the health monitor
    pub async fn beat(&self, now: DateTime<Utc>) -> Result<(), Error> {
        let result = self.renew(now).await;
        self.health.set(result.is_ok());
        match &result {
            Ok(()) => debug!(seed = %self.seed, "Renewed seed lease"),
            Err(e) => warn!(seed = %self.seed, error = %e, "Failed to renew seed lease"),
        }
        result
    }

    async fn renew(&self, now: DateTime<Utc>) -> Result<(), Error> {
        let lease = seed_lease(&self.seed, now, self.resync);
        match self.api.get(SEED_LEASE_NAMESPACE, &self.seed).await? {
            None => self.api.create(&lease).await,
            Some(_) => {
                let patch = json!({ "spec": serde_json::to_value(&lease.spec).map_err(|e| {
                    Error::serialization_for_kind("Lease", e.to_string())
                })? });
                self.api.patch(SEED_LEASE_NAMESPACE, &self.seed, &patch).await
            }
        }
    }

    /// Beat every resync period until `cancel` fires; failures only affect health
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(self.resync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(seed = %self.seed, period = ?self.resync, "Starting seed lease heartbeat");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let _ = self.beat(Utc::now()).await;
                }
            }
        }
    }
}
