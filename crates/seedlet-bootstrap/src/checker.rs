//! Sanity check of the configured seed networks against the seed cluster
//!
//! Seeds that are themselves shoots carry a `kube-system/shoot-info`
//! ConfigMap describing their real networks. Registering different CIDRs
//! would make the garden schedule overlapping shoots onto the seed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::{debug, info};

use seedlet_common::crd::SeedNetworks;
use seedlet_common::Error;

const SHOOT_INFO_NAMESPACE: &str = "kube-system";
const SHOOT_INFO_NAME: &str = "shoot-info";

/// Source of the seed cluster's shoot-info data
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShootInfoSource: Send + Sync {
    /// The ConfigMap data, or `None` when the seed is not a shoot
    async fn shoot_info(&self) -> Result<Option<BTreeMap<String, String>>, Error>;
}

/// [`ShootInfoSource`] reading from the seed cluster
pub struct KubeShootInfoSource {
    client: Client,
}

impl KubeShootInfoSource {
    /// Wrap a seed client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ShootInfoSource for KubeShootInfoSource {
    async fn shoot_info(&self) -> Result<Option<BTreeMap<String, String>>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), SHOOT_INFO_NAMESPACE);
        Ok(api
            .get_opt(SHOOT_INFO_NAME)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }
}

/// Compare configured networks with shoot-info data
///
/// Only keys present in `info` are checked; the node network is only
/// compared when configured.
pub fn check_networks(
    networks: &SeedNetworks,
    info: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let checks = [
        ("podNetwork", "seedConfig.spec.networks.pods", Some(networks.pods.as_str())),
        ("serviceNetwork", "seedConfig.spec.networks.services", Some(networks.services.as_str())),
        ("nodeNetwork", "seedConfig.spec.networks.nodes", networks.nodes.as_deref()),
    ];

    for (key, field, configured) in checks {
        let (Some(actual), Some(configured)) = (info.get(key), configured) else {
            continue;
        };
        if actual != configured {
            return Err(Error::config(
                field,
                format!("configured {configured} but the seed cluster uses {actual}"),
            ));
        }
    }
    Ok(())
}

/// Bootstrap runnable rejecting seed configs that contradict the cluster
pub struct SeedConfigChecker<S: ShootInfoSource = KubeShootInfoSource> {
    networks: SeedNetworks,
    source: S,
}

impl<S: ShootInfoSource> SeedConfigChecker<S> {
    /// Checker for `networks`
    pub fn new(networks: SeedNetworks, source: S) -> Self {
        Self { networks, source }
    }

    /// Run the check once
    pub async fn run(&self) -> Result<(), Error> {
        match self.source.shoot_info().await? {
            None => {
                debug!("No shoot-info ConfigMap, skipping seed network check");
                Ok(())
            }
            Some(info) => {
                check_networks(&self.networks, &info)?;
                info!("Seed networks match the cluster");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn networks() -> SeedNetworks {
        SeedNetworks {
            nodes: Some("10.250.0.0/16".to_string()),
            pods: "100.96.0.0/11".to_string(),
            services: "100.64.0.0/13".to_string(),
            shoot_defaults: None,
        }
    }

    fn info(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::all_match(
        &[
            ("podNetwork", "100.96.0.0/11"),
            ("serviceNetwork", "100.64.0.0/13"),
            ("nodeNetwork", "10.250.0.0/16"),
        ],
        true
    )]

    #[case::partial_info(&[("podNetwork", "100.96.0.0/11")], true)]
    #[case::empty(&[], true)]
    #[case::pods_differ(&[("podNetwork", "10.0.0.0/8")], false)]
    #[case::nodes_differ(&[("nodeNetwork", "10.0.0.0/8")], false)]
    fn compares_present_keys(#[case] pairs: &[(&str, &str)], #[case] ok: bool) {
        assert_eq!(check_networks(&networks(), &info(pairs)).is_ok(), ok);
    }

    #[test]
    fn unset_node_network_is_not_compared() {
        let mut networks = networks();
        networks.nodes = None;
        assert!(check_networks(&networks, &info(&[("nodeNetwork", "10.0.0.0/8")])).is_ok());
    }

    #[tokio::test]
    async fn mismatch_is_a_config_error() {
        let mut source = MockShootInfoSource::new();
        source
            .expect_shoot_info()
            .returning(|| Ok(Some(info(&[("serviceNetwork", "10.96.0.0/12")]))));

        let err = SeedConfigChecker::new(networks(), source).run().await.unwrap_err();
        match err {
            Error::Config { field, .. } => assert_eq!(field, "seedConfig.spec.networks.services"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_shoot_info_passes() {
        let mut source = MockShootInfoSource::new();
        source.expect_shoot_info().returning(|| Ok(None));
        SeedConfigChecker::new(networks(), source).run().await.unwrap();
    }
}
