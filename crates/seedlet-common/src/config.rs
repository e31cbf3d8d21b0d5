//! Component configuration
//!
//! `SeedletConfiguration` is loaded once at startup from YAML, adjusted by
//! environment overrides and validated. After that it is shared read-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crd::{SecretReference, SeedSpec};
use crate::{Error, SEED_NAMESPACE_PREFIX};

/// Overrides the garden kubeconfig path
pub const GARDEN_KUBECONFIG_ENV: &str = "GARDEN_KUBECONFIG";
/// Overrides the seed kubeconfig path
pub const SEED_KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Source of environment overrides
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set and non-empty
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// Accepted values of `logLevel`
pub const LOG_LEVELS: &[&str] = &["debug", "info", "error"];

/// Top-level configuration file
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedletConfiguration {
    /// Connection to the garden cluster
    #[serde(default)]
    pub garden_client_connection: GardenClientConnection,
    /// Connection to the seed cluster
    #[serde(default)]
    pub seed_client_connection: SeedClientConnection,
    /// Leader election among replicas
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Controller tuning
    #[serde(default)]
    pub controllers: ControllersConfig,
    /// Log verbosity: `debug`, `info` or `error`; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log encoding
    #[serde(default)]
    pub log_format: LogFormat,
    /// The seed this agent registers
    pub seed_config: SeedTemplate,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Encoding of log lines on stdout
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable lines
    Text,
}

/// Garden connection settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GardenClientConnection {
    /// Kubeconfig file for the garden; takes precedence over the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Seed-cluster secret holding a bootstrap-token kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_kubeconfig: Option<SecretReference>,
    /// Seed-cluster secret where the issued kubeconfig is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret: Option<SecretReference>,
    /// Certificate lifetime and rotation jitter
    #[serde(default)]
    pub kubeconfig_validity: KubeconfigValidity,
}

/// Requested certificate validity and when to rotate within it
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigValidity {
    /// Requested lifetime; the signer's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_seconds: Option<u64>,
    /// Earliest rotation point, as a percentage of the lifetime
    #[serde(default = "default_jitter_min")]
    pub auto_rotation_jitter_percentage_min: u8,
    /// Latest rotation point, as a percentage of the lifetime
    #[serde(default = "default_jitter_max")]
    pub auto_rotation_jitter_percentage_max: u8,
}

fn default_jitter_min() -> u8 {
    70
}

fn default_jitter_max() -> u8 {
    90
}

impl Default for KubeconfigValidity {
    fn default() -> Self {
        Self {
            validity_seconds: None,
            auto_rotation_jitter_percentage_min: default_jitter_min(),
            auto_rotation_jitter_percentage_max: default_jitter_max(),
        }
    }
}

impl KubeconfigValidity {
    /// Requested certificate lifetime
    pub fn validity(&self) -> Option<Duration> {
        self.validity_seconds.map(Duration::from_secs)
    }
}

/// Seed connection settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedClientConnection {
    /// Kubeconfig file; in-cluster config when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

/// Leader election settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Whether to elect a leader at all
    pub leader_elect: bool,
    /// Lease name
    pub resource_name: String,
    /// Lease namespace in the seed
    pub resource_namespace: String,
    /// Lease validity
    pub lease_duration_seconds: u64,
    /// How often the leader renews
    pub renew_interval_seconds: u64,
    /// How often a standby retries
    pub retry_interval_seconds: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            leader_elect: true,
            resource_name: "seedlet-leader-election".to_string(),
            resource_namespace: crate::GARDEN_NAMESPACE.to_string(),
            lease_duration_seconds: 15,
            renew_interval_seconds: 5,
            retry_interval_seconds: 2,
        }
    }
}

/// HTTP server settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Liveness and readiness endpoints
    #[serde(default)]
    pub health_probes: HealthProbesConfig,
}

/// Probe server address
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbesConfig {
    /// Interface to bind
    pub bind_address: String,
    /// Port to bind
    pub port: u16,
}

impl Default for HealthProbesConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2728,
        }
    }
}

/// Controller tuning
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllersConfig {
    /// Seed lease heartbeat
    #[serde(default)]
    pub seed: SeedControllerConfig,
}

/// Seed lease heartbeat settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedControllerConfig {
    /// Heartbeat period
    pub lease_resync_seconds: u64,
    /// Missed heartbeats tolerated before the seed counts as unhealthy
    pub lease_resync_miss_threshold: u32,
}

impl Default for SeedControllerConfig {
    fn default() -> Self {
        Self {
            lease_resync_seconds: 2,
            lease_resync_miss_threshold: 10,
        }
    }
}

/// Desired Seed object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedTemplate {
    /// Name, labels and annotations
    pub metadata: SeedMetadata,
    /// Desired spec; owned entirely by this agent
    pub spec: SeedSpec,
}

/// Seed metadata owned by this agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedMetadata {
    /// Seed name
    pub name: String,
    /// Labels merged into the Seed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations merged into the Seed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl SeedletConfiguration {
    /// Parse a configuration document
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::config("<root>", e.to_string()))
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config("--config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Load, apply overrides and validate in one step
    pub fn load(path: &Path, env: &dyn EnvSource) -> Result<Self, Error> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides(env);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `GARDEN_KUBECONFIG` and `KUBECONFIG`
    pub fn apply_env_overrides(&mut self, env: &dyn EnvSource) {
        if let Some(path) = env.var(GARDEN_KUBECONFIG_ENV) {
            self.garden_client_connection.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(path) = env.var(SEED_KUBECONFIG_ENV) {
            self.seed_client_connection.kubeconfig = Some(PathBuf::from(path));
        }
    }

    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        let name = &self.seed_config.metadata.name;
        if name.is_empty() {
            return Err(Error::config("seedConfig.metadata.name", "must not be empty"));
        }
        let max = 63 - SEED_NAMESPACE_PREFIX.len();
        if name.len() > max || !is_dns1123_label(name) {
            return Err(Error::config(
                "seedConfig.metadata.name",
                format!("{name:?} must be a DNS-1123 label of at most {max} characters"),
            ));
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Error::config(
                "logLevel",
                format!("{:?} is not one of {LOG_LEVELS:?}", self.log_level),
            ));
        }

        let validity = &self.garden_client_connection.kubeconfig_validity;
        let (min, max) = (
            validity.auto_rotation_jitter_percentage_min,
            validity.auto_rotation_jitter_percentage_max,
        );
        if min > 100 || max > 100 || min > max {
            return Err(Error::config(
                "gardenClientConnection.kubeconfigValidity",
                format!("jitter range {min}..={max} must lie within 0..=100 with min <= max"),
            ));
        }
        if validity.validity_seconds == Some(0) {
            return Err(Error::config(
                "gardenClientConnection.kubeconfigValidity.validitySeconds",
                "must be positive",
            ));
        }

        let garden = &self.garden_client_connection;
        if garden.kubeconfig.is_none() {
            match (&garden.kubeconfig_secret, &garden.bootstrap_kubeconfig) {
                (None, _) => {
                    return Err(Error::config(
                        "gardenClientConnection",
                        "either kubeconfig or kubeconfigSecret must be set",
                    ))
                }
                (Some(_), None) => {
                    return Err(Error::config(
                        "gardenClientConnection.bootstrapKubeconfig",
                        "required when kubeconfigSecret is used without a kubeconfig",
                    ))
                }
                (Some(_), Some(_)) => {}
            }
        }

        let seed = &self.controllers.seed;
        if seed.lease_resync_seconds == 0 || seed.lease_resync_miss_threshold == 0 {
            return Err(Error::config(
                "controllers.seed",
                "leaseResyncSeconds and leaseResyncMissThreshold must be positive",
            ));
        }

        let le = &self.leader_election;
        if le.leader_elect && le.renew_interval_seconds >= le.lease_duration_seconds {
            return Err(Error::config(
                "leaderElection.renewIntervalSeconds",
                "must be shorter than leaseDurationSeconds",
            ));
        }

        Ok(())
    }

    /// Seed name
    pub fn seed_name(&self) -> &str {
        &self.seed_config.metadata.name
    }

    /// How long a positive heartbeat stays valid
    pub fn health_grace(&self) -> Duration {
        let seed = &self.controllers.seed;
        Duration::from_secs(
            seed.lease_resync_seconds
                .saturating_mul(u64::from(seed.lease_resync_miss_threshold)),
        )
    }

    /// Heartbeat period
    pub fn lease_resync(&self) -> Duration {
        Duration::from_secs(self.controllers.seed.lease_resync_seconds)
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
pub fn is_dns1123_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINIMAL: &str = r#"
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
    labels:
      team: x
  spec:
    provider:
      type: aws
      region: eu-west-1
    networks:
      pods: 100.96.0.0/11
      services: 100.64.0.0/13
"#;

    fn minimal() -> SeedletConfiguration {
        SeedletConfiguration::from_yaml(MINIMAL).unwrap()
    }

    #[test]
    fn defaults_are_filled_in() {
        let cfg = minimal();
        assert!(cfg.leader_election.leader_elect);
        assert_eq!(cfg.server.health_probes.port, 2728);
        assert_eq!(cfg.controllers.seed.lease_resync_seconds, 2);
        assert_eq!(
            cfg.garden_client_connection
                .kubeconfig_validity
                .auto_rotation_jitter_percentage_min,
            70
        );
        assert_eq!(cfg.seed_config.spec.provider.region, "eu-west-1");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_format, LogFormat::Json);
        cfg.validate().unwrap();
    }

    #[test]
    fn health_grace_is_resync_times_threshold() {
        let mut cfg = minimal();
        cfg.controllers.seed.lease_resync_seconds = 3;
        cfg.controllers.seed.lease_resync_miss_threshold = 4;
        assert_eq!(cfg.health_grace(), Duration::from_secs(12));
    }

    #[test]
    fn huge_health_grace_saturates() {
        let mut cfg = minimal();
        cfg.controllers.seed.lease_resync_seconds = u64::MAX / 2;
        cfg.controllers.seed.lease_resync_miss_threshold = 3;
        assert_eq!(cfg.health_grace(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn env_overrides_replace_kubeconfig_paths() {
        let mut env = MockEnvSource::new();
        env.expect_var()
            .withf(|k| k.to_string() == GARDEN_KUBECONFIG_ENV)
            .returning(|_| Some("/etc/garden/kubeconfig".to_string()));
        env.expect_var()
            .withf(|k| k.to_string() == SEED_KUBECONFIG_ENV)
            .returning(|_| None);

        let mut cfg = minimal();
        cfg.apply_env_overrides(&env);
        assert_eq!(
            cfg.garden_client_connection.kubeconfig,
            Some(PathBuf::from("/etc/garden/kubeconfig"))
        );
        assert!(cfg.seed_client_connection.kubeconfig.is_none());
    }

    #[rstest]
    #[case::empty_name(
        |c: &mut SeedletConfiguration| c.seed_config.metadata.name.clear(),
        "seedConfig.metadata.name"
    )]
    #[case::uppercase_name(
        |c: &mut SeedletConfiguration| c.seed_config.metadata.name = "AWS".into(),
        "seedConfig.metadata.name"
    )]
    #[case::jitter_inverted(
        |c: &mut SeedletConfiguration| {
            c.garden_client_connection.kubeconfig_validity.auto_rotation_jitter_percentage_min = 95
        },
        "kubeconfigValidity"
    )]
    #[case::jitter_over_100(
        |c: &mut SeedletConfiguration| {
            c.garden_client_connection.kubeconfig_validity.auto_rotation_jitter_percentage_max = 101
        },
        "kubeconfigValidity"
    )]
    #[case::zero_resync(
        |c: &mut SeedletConfiguration| c.controllers.seed.lease_resync_seconds = 0,
        "controllers.seed"
    )]
    #[case::no_bootstrap(
        |c: &mut SeedletConfiguration| c.garden_client_connection.bootstrap_kubeconfig = None,
        "bootstrapKubeconfig"
    )]
    #[case::no_garden_access(
        |c: &mut SeedletConfiguration| c.garden_client_connection.kubeconfig_secret = None,
        "gardenClientConnection"
    )]
    #[case::unknown_log_level(
        |c: &mut SeedletConfiguration| c.log_level = "trace".into(),
        "logLevel"
    )]

    fn invalid_configs_are_rejected(
        #[case] mutate: fn(&mut SeedletConfiguration),
        #[case] field: &str,
    ) {
        let mut cfg = minimal();
        mutate(&mut cfg);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains(field), "{err}");
    }

    #[test]
    fn kubeconfig_path_makes_bootstrap_optional() {
        let mut cfg = minimal();
        cfg.garden_client_connection.bootstrap_kubeconfig = None;
        cfg.garden_client_connection.kubeconfig = Some(PathBuf::from("/kubeconfig"));
        cfg.validate().unwrap();
    }

    #[test]
    fn load_reads_file_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let mut env = MockEnvSource::new();
        env.expect_var().returning(|_| None);

        let cfg = SeedletConfiguration::load(&path, &env).unwrap();
        assert_eq!(cfg.seed_name(), "aws-eu1");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = SeedletConfiguration::from_file(Path::new("/nonexistent/seedlet.yaml"))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[rstest]
    #[case("aws-eu1", true)]
    #[case("a", true)]
    #[case("-a", false)]
    #[case("a-", false)]
    #[case("a.b", false)]
    #[case("", false)]
    fn dns1123_labels(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(is_dns1123_label(input), valid);
    }
}
