//! Runnables wiring bootstrap, registration and maintenance into the lifecycle
//!
//! Bootstrap group: [`SeedConfigCheck`] and [`GardenBootstrap`].
//! Main group: [`GardenRunnable`], which picks up the bootstrap credential,
//! builds the scoped garden cache, registers the seed, runs the startup
//! maintenance and then keeps the heartbeat, certificate rotation and
//! reconcilers running until shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use seedlet_bootstrap::checker::{KubeShootInfoSource, ShootInfoSource};
use seedlet_bootstrap::cleanup::{delete_bootstrap_auth, KubeBootstrapAuthApi};
use seedlet_bootstrap::kubeconfig;
use seedlet_bootstrap::secrets::{KubeGardenConnector, KubeSecretStore};
use seedlet_bootstrap::{
    BootstrapResult, CredentialRotator, CredentialStore, GardenKubeconfigBootstrapper,
    SeedConfigChecker,
};
use seedlet_cache::{garden_topology, ScopedClient, SyncStatus, DEFAULT_SYNC_TIMEOUT};
use seedlet_common::config::SeedletConfiguration;
use seedlet_common::crd::{Seed, Shoot};
use seedlet_common::health::PeriodicHealth;
use seedlet_common::kube_utils::create_client_from_kubeconfig;
use seedlet_common::Error;

use crate::heartbeat::{GardenLeaseApi, SeedHeartbeat};
use crate::lifecycle::Runnable;
use crate::maintenance::{abort_processing_shoots, run_seed_maintenance, KubeSeedObjects};
use crate::reconcilers::{ReconcilerContext, ReconcilerSet};
use crate::registration::{register_seed, NamespaceWait, ScopedSeedRegistry};

/// Bound for the initial garden cache sync
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Cancel `restart` once the garden credential is swapped
///
/// Clients and caches hold the kubeconfig they were built with, so the steady
/// state is torn down and the agent restarts on the rotated credential, which
/// is already stored in the kubeconfig secret by then.
pub async fn restart_on_rotation(
    mut rotated: watch::Receiver<Arc<Vec<u8>>>,
    restart: CancellationToken,
) {
    tokio::select! {
        _ = restart.cancelled() => {}
        changed = rotated.changed() => {
            if changed.is_ok() {
                info!("Garden credential rotated, restarting");
                restart.cancel();
            }
        }
    }
}

/// Rejects a seed config whose networks contradict the cluster
pub struct SeedConfigCheck<S: ShootInfoSource = KubeShootInfoSource> {
    checker: SeedConfigChecker<S>,
}

impl SeedConfigCheck {
    /// Check the configured networks against the seed cluster
    pub fn new(config: &SeedletConfiguration, seed: Client) -> Self {
        Self::with_source(config, KubeShootInfoSource::new(seed))
    }
}

impl<S: ShootInfoSource> SeedConfigCheck<S> {
    /// Check against an arbitrary shoot-info source
    pub fn with_source(config: &SeedletConfiguration, source: S) -> Self {
        Self {
            checker: SeedConfigChecker::new(config.seed_config.spec.networks.clone(), source),
        }
    }
}

#[async_trait]
impl<S: ShootInfoSource> Runnable for SeedConfigCheck<S> {
    fn name(&self) -> &str {
        "seed-config-checker"
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<(), Error> {
        self.checker.run().await
    }
}

/// Obtains the garden credential
pub struct GardenBootstrap {
    bootstrapper: GardenKubeconfigBootstrapper,
}

impl GardenBootstrap {
    /// Bootstrapper storing its kubeconfig secret on the seed
    pub fn new(config: &SeedletConfiguration, seed: Client, result: BootstrapResult) -> Self {
        Self {
            bootstrapper: GardenKubeconfigBootstrapper::new(
                config,
                Arc::new(KubeSecretStore::new(seed)),
                Arc::new(KubeGardenConnector),
                result,
            ),
        }
    }
}

#[async_trait]
impl Runnable for GardenBootstrap {
    fn name(&self) -> &str {
        "garden-kubeconfig-bootstrapper"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        self.bootstrapper.run(&cancel).await
    }
}

/// The seed agent's main runnable
pub struct GardenRunnable {
    config: SeedletConfiguration,
    seed: Client,
    bootstrap: BootstrapResult,
    health: PeriodicHealth,
    sync: SyncStatus,
    reconcilers: Arc<dyn ReconcilerSet>,
}

impl GardenRunnable {
    /// Runnable reading the credential from `bootstrap`; cache sync is
    /// reported through `sync` and lease health through `health`
    pub fn new(
        config: SeedletConfiguration,
        seed: Client,
        bootstrap: BootstrapResult,
        health: PeriodicHealth,
        sync: SyncStatus,
        reconcilers: Arc<dyn ReconcilerSet>,
    ) -> Self {
        Self {
            config,
            seed,
            bootstrap,
            health,
            sync,
            reconcilers,
        }
    }

    async fn steady_state(
        &self,
        garden: ScopedClient,
        store: CredentialStore,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let seed_name = self.config.seed_name();
        let steady = cancel.child_token();
        let rotated = store.subscribe();
        let heartbeat = SeedHeartbeat::new(
            Arc::new(GardenLeaseApi::new(store.clone())),
            self.health.clone(),
            seed_name,
            self.config.lease_resync(),
        );
        let rotator = match self.config.garden_client_connection.kubeconfig_secret {
            Some(_) => Some(CredentialRotator::new(
                &self.config,
                store,
                Arc::new(KubeSecretStore::new(self.seed.clone())),
                Arc::new(KubeGardenConnector),
            )?),
            None => None,
        };
        let ctx = ReconcilerContext {
            seed_name: seed_name.to_string(),
            garden,
            seed: self.seed.clone(),
            health: self.health.clone(),
        };

        let rotation = async {
            match &rotator {
                Some(rotator) => rotator.run(steady.clone()).await,
                None => Ok(()),
            }
        };
        let restart = async {
            restart_on_rotation(rotated, steady.clone()).await;
            Ok(())
        };
        tokio::try_join!(
            heartbeat.run(steady.clone()),
            rotation,
            self.reconcilers.run(ctx, steady.clone()),
            restart,
        )?;
        if !cancel.is_cancelled() {
            info!(seed = %seed_name, "Garden runnable stopped for credential rotation");
        }
        Ok(())
    }
}

#[async_trait]
impl Runnable for GardenRunnable {
    fn name(&self) -> &str {
        "garden"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let credential = self.bootstrap.get().cloned().ok_or_else(|| {
            Error::internal_with_context("garden", "bootstrap finished without a garden credential")
        })?;
        let seed_name = self.config.seed_name();

        let garden_client =
            create_client_from_kubeconfig(kubeconfig::parse(&credential.kubeconfig)?).await?;

        let store = CredentialStore::new(credential.kubeconfig.clone());
        let garden = ScopedClient::with_sync_status(
            garden_client.clone(),
            garden_topology(seed_name)?,
            cancel.child_token(),
            DEFAULT_SYNC_TIMEOUT,
            self.sync.clone(),
        );

        if let (Some(csr), Some(_)) = (&credential.csr_name, &credential.seed_name) {
            info!(csr = %csr, "Removing bootstrap authentication");
            delete_bootstrap_auth(&KubeBootstrapAuthApi::new(garden_client), csr).await?;
        }

        garden.start::<Seed>()?;
        garden.start::<Shoot>()?;
        garden.wait_for_cache_sync(CACHE_SYNC_TIMEOUT).await?;

        info!(seed = %seed_name, "Registering seed");
        register_seed(
            &ScopedSeedRegistry::new(garden.clone()),
            &self.config.seed_config,
            NamespaceWait::default(),
            &cancel,
        )
        .await?;

        abort_processing_shoots(&garden, seed_name, &cancel).await?;
        run_seed_maintenance(&KubeSeedObjects::new(self.seed.clone()), &cancel).await?;
        info!(seed = %seed_name, "Startup maintenance finished");

        self.steady_state(garden, store, &cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use seedlet_bootstrap::GardenCredential;

    use crate::reconcilers::IdleReconcilers;

    const CONFIG: &str = r#"
gardenClientConnection:
  kubeconfigSecret:
    name: seedlet-kubeconfig
    namespace: garden
  bootstrapKubeconfig:
    name: seedlet-kubeconfig-bootstrap
    namespace: garden
seedConfig:
  metadata:
    name: aws-eu1
  spec:
    provider:
      type: aws
      region: eu-west-1
    networks:
      pods: 100.96.0.0/11
      services: 100.64.0.0/13
"#;

    fn minimal_config() -> SeedletConfiguration {
        SeedletConfiguration::from_yaml(CONFIG).unwrap()
    }

    struct ShootInfo(Option<BTreeMap<String, String>>);

    #[async_trait]
    impl ShootInfoSource for ShootInfo {
        async fn shoot_info(&self) -> Result<Option<BTreeMap<String, String>>, Error> {
            Ok(self.0.clone())
        }
    }

    fn offline_client() -> Client {
        // Same process-level provider main() installs; both rustls backends are compiled in
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let uri: http::Uri = "http://127.0.0.1:9".parse().unwrap();
        Client::try_from(kube::Config::new(uri)).unwrap()
    }

    fn runnable(result: BootstrapResult) -> GardenRunnable {
        GardenRunnable::new(
            minimal_config(),
            offline_client(),
            result,
            PeriodicHealth::new(Duration::from_secs(20)),
            SyncStatus::default(),
            Arc::new(IdleReconcilers),
        )
    }

    #[tokio::test]
    async fn seed_that_is_no_shoot_passes_the_check() {
        let check = SeedConfigCheck::with_source(&minimal_config(), ShootInfo(None));
        assert_eq!(check.name(), "seed-config-checker");
        check.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_shoot_networks_fail_the_check() {
        let info = BTreeMap::from([("podNetwork".to_string(), "192.168.0.0/16".to_string())]);
        let check = SeedConfigCheck::with_source(&minimal_config(), ShootInfo(Some(info)));
        assert!(check.run(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn main_runnable_needs_a_bootstrap_credential() {
        let err = runnable(BootstrapResult::new())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("garden"));
    }

    #[tokio::test]
    async fn unreadable_credential_is_rejected_before_any_garden_call() {
        let result = BootstrapResult::new();
        result
            .set(GardenCredential::existing(b"not: [a kubeconfig".to_vec()))
            .unwrap();
        assert!(runnable(result).run(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn story_rotated_credential_restarts_the_steady_state() {
        let store = CredentialStore::new(b"old".to_vec());
        let restart = CancellationToken::new();
        let watcher = tokio::spawn(restart_on_rotation(store.subscribe(), restart.clone()));

        tokio::task::yield_now().await;
        assert!(!restart.is_cancelled());

        store.swap(b"rotated".to_vec());
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(restart.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_without_rotation_stops_the_watch() {
        let store = CredentialStore::new(b"old".to_vec());
        let restart = CancellationToken::new();
        restart.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            restart_on_rotation(store.subscribe(), restart.clone()),
        )
        .await
        .unwrap();
        assert_eq!(store.current().as_slice(), b"old");
    }
}
