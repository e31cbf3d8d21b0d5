//! Garden certificate rotation
//!
//! The rotation point is picked once per process somewhere between the
//! configured minimum and maximum percentage of the certificate lifetime, so
//! replicas of many seeds do not all renew at the same moment. Renewal
//! authenticates with the current certificate, stores the new kubeconfig and
//! swaps it into the [`CredentialStore`] that garden clients watch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::csr::default_poll;
use crate::manager::{client_certificate_info, issue_kubeconfig, record_expiry};
use crate::secrets::{GardenConnector, SecretStore};
use seedlet_common::config::SeedletConfiguration;
use seedlet_common::crd::SecretReference;
use seedlet_common::retry::{retry_with_backoff, RetryConfig};
use seedlet_common::Error;

/// In-memory garden kubeconfig with change notification
#[derive(Clone, Debug)]
pub struct CredentialStore {
    tx: Arc<watch::Sender<Arc<Vec<u8>>>>,
}

impl CredentialStore {
    /// Store holding `kubeconfig`
    pub fn new(kubeconfig: Vec<u8>) -> Self {
        let (tx, _) = watch::channel(Arc::new(kubeconfig));
        Self { tx: Arc::new(tx) }
    }

    /// Current kubeconfig
    pub fn current(&self) -> Arc<Vec<u8>> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every swap
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<u8>>> {
        self.tx.subscribe()
    }

    /// Replace the kubeconfig; readers holding the old one keep it
    pub fn swap(&self, kubeconfig: Vec<u8>) {
        self.tx.send_replace(Arc::new(kubeconfig));
    }
}

/// Random fraction of the lifetime between `min_pct` and `max_pct` percent
pub fn rotation_fraction(min_pct: u8, max_pct: u8, rng: &mut impl Rng) -> f64 {
    let min = f64::from(min_pct.min(max_pct)) / 100.0;
    let max = f64::from(max_pct.max(min_pct)) / 100.0;
    if max <= min {
        return min;
    }
    rng.gen_range(min..=max)
}

/// Long-running rotation of the garden client certificate
pub struct CredentialRotator {
    seed_name: String,
    secret: SecretReference,
    validity: Option<Duration>,
    fraction: f64,
    store: CredentialStore,
    secrets: Arc<dyn SecretStore>,
    connector: Arc<dyn GardenConnector>,
    poll: RetryConfig,
    retry: RetryConfig,
}

impl CredentialRotator {
    /// Rotator for the configured kubeconfig secret
    ///
    /// Fails when the garden credential does not live in a secret.
    pub fn new(
        config: &SeedletConfiguration,
        store: CredentialStore,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn GardenConnector>,
    ) -> Result<Self, Error> {
        let garden = &config.garden_client_connection;
        let secret = garden.kubeconfig_secret.clone().ok_or_else(|| {
            Error::config(
                "gardenClientConnection.kubeconfigSecret",
                "rotation needs a kubeconfig secret",
            )
        })?;
        let validity = &garden.kubeconfig_validity;
        Ok(Self {
            seed_name: config.seed_name().to_string(),
            secret,
            validity: validity.validity(),
            fraction: rotation_fraction(
                validity.auto_rotation_jitter_percentage_min,
                validity.auto_rotation_jitter_percentage_max,
                &mut rand::thread_rng(),
            ),
            store,
            secrets,
            connector,
            poll: default_poll(),
            retry: RetryConfig {
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                ..RetryConfig::infinite()
            },
        })
    }

    /// Pin the rotation point
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction;
        self
    }

    /// Override CSR polling and renewal retry settings
    pub fn with_retry(mut self, poll: RetryConfig, retry: RetryConfig) -> Self {
        self.poll = poll;
        self.retry = retry;
        self
    }

    /// When the current certificate should be replaced; `None` when the
    /// kubeconfig does not authenticate with a certificate
    pub fn deadline(&self) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(client_certificate_info(&self.store.current())?
            .map(|info| info.deadline_at_fraction(self.fraction)))
    }

    /// Renew if `now` is past the deadline; returns whether it renewed
    pub async fn rotate_if_needed(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        match self.deadline()? {
            Some(deadline) if now >= deadline => {
                self.rotate(cancel).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Sleep until each deadline and renew, until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        loop {
            let Some(deadline) = self.deadline()? else {
                info!("Garden kubeconfig does not use a client certificate, rotation disabled");
                cancel.cancelled().await;
                return Ok(());
            };
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!(%deadline, "Scheduled garden certificate rotation");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }

            let renewed = retry_with_backoff(&self.retry, &cancel, "rotate_garden_certificate", || {
                self.rotate(&cancel)
            })
            .await;
            match renewed {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Garden certificate rotation failed permanently");
                    return Err(e);
                }
            }
        }
    }

    async fn rotate(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let current = self.store.current();
        let (rendered, issued) = issue_kubeconfig(
            self.connector.as_ref(),
            &current,
            &self.seed_name,
            self.validity,
            &self.poll,
            cancel,
        )
        .await?;

        self.secrets
            .write_kubeconfig(&self.secret.namespace, &self.secret.name, &rendered)
            .await?;
        if let Some(info) = client_certificate_info(&rendered)? {
            record_expiry(&info, Utc::now());
        }
        self.store.swap(rendered);
        info!(csr = %issued.csr_name, "Rotated garden certificate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::manager::tests::{cert_kubeconfig, config, fast_poll, issuing_csr_api};
    use crate::secrets::{MockGardenConnector, MockSecretStore};

    fn rotator(
        kubeconfig: Vec<u8>,
        secrets: MockSecretStore,
        connector: MockGardenConnector,
    ) -> (CredentialRotator, CredentialStore) {
        let store = CredentialStore::new(kubeconfig);
        let (secrets, connector) = (Arc::new(secrets), Arc::new(connector));
        let rotator = CredentialRotator::new(&config(), store.clone(), secrets, connector)
            .unwrap()
            .with_fraction(0.8)
            .with_retry(fast_poll(), fast_poll());
        (rotator, store)
    }

    #[test]
    fn fraction_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let f = rotation_fraction(70, 90, &mut rng);
            assert!((0.7..=0.9).contains(&f));
        }
        assert_eq!(rotation_fraction(80, 80, &mut rng), 0.8);
        // swapped bounds still land inside the range
        let f = rotation_fraction(90, 70, &mut rng);
        assert!((0.7..=0.9).contains(&f));
    }

    #[test]
    fn store_swaps_and_notifies() {
        let store = CredentialStore::new(b"old".to_vec());
        let mut rx = store.subscribe();
        let held = store.current();

        store.swap(b"new".to_vec());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_slice(), b"new");
        assert_eq!(held.as_slice(), b"old");
    }

    #[tokio::test]
    async fn story_valid_credential_rotation_makes_no_calls() {
        // mocks without expectations panic on any call
        let (rotator, store) = rotator(
            cert_kubeconfig(2024, 2124),
            MockSecretStore::new(),
            MockGardenConnector::new(),
        );
        let before = store.current();

        let renewed = rotator
            .rotate_if_needed(Utc::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!renewed);
        assert!(Arc::ptr_eq(&before, &store.current()));
    }

    #[tokio::test]
    async fn due_certificate_is_renewed_and_swapped() {
        let current = cert_kubeconfig(2020, 2030);
        let expected_auth = current.clone();

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_write_kubeconfig()
            .withf(|ns, name, _| {
                ns.to_string() == "garden" && name.to_string() == "garden-kubeconfig"
            })

            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut connector = MockGardenConnector::new();
        connector
            .expect_csr_api()
            .withf(move |kc| kc == expected_auth.as_slice())
            .times(1)
            .return_once(|_| Ok(issuing_csr_api()));

        let (rotator, store) = rotator(current.clone(), secrets, connector);
        let mut rx = store.subscribe();
        let deadline = rotator.deadline().unwrap().unwrap();

        let renewed = rotator
            .rotate_if_needed(deadline, &CancellationToken::new())
            .await
            .unwrap();
        assert!(renewed);
        assert!(rx.has_changed().unwrap());
        assert_ne!(store.current().as_slice(), current.as_slice());
    }

    #[tokio::test]
    async fn token_kubeconfig_has_no_deadline() {
        let (rotator, _) = rotator(
            crate::kubeconfig::tests::bootstrap_kubeconfig(),
            MockSecretStore::new(),
            MockGardenConnector::new(),
        );
        assert_eq!(rotator.deadline().unwrap(), None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        rotator.run(cancel).await.unwrap();
    }

    #[test]
    fn rotation_requires_a_secret() {
        let mut config = config();
        config.garden_client_connection.kubeconfig_secret = None;
        let result = CredentialRotator::new(
            &config,
            CredentialStore::new(Vec::new()),
            Arc::new(MockSecretStore::new()),
            Arc::new(MockGardenConnector::new()),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
