//! Let shoot Prometheus instances reach the cache Prometheus and seed Alertmanager

use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use seedlet_common::flow::{parallel, Task};
use seedlet_common::{Error, SHOOT_NAMESPACE_PREFIX};

use super::{SeedKind, SeedObjects};

const SELECTOR: &str = "app=prometheus,role=monitoring,seedlet.dev/role=monitoring";
const CONFIG_MAP: &str = "prometheus-config";
const CONFIG_KEY: &str = "prometheus.yaml";
const OLD_TARGET: &str = "prometheus-web.garden.svc";
const NEW_TARGET: &str = "prometheus-cache.garden.svc";

/// Pod labels that open network access to the garden monitoring stack
pub const NETWORK_LABELS: [&str; 2] = [
    "networking.resources.seedlet.dev/to-garden-prometheus-cache-tcp-9090",
    "networking.resources.seedlet.dev/to-garden-alertmanager-seed-tcp-9093",
];

/// Rewrite the scrape config and pod labels of every shoot Prometheus
pub async fn update_shoot_prometheus(
    seed: &dyn SeedObjects,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let targets: Vec<(String, String)> = seed
        .list_stateful_sets(SELECTOR)
        .await?
        .iter()
        .filter_map(|sts| Some((sts.namespace()?, sts.name_any())))
        .filter(|(ns, _)| ns.starts_with(SHOOT_NAMESPACE_PREFIX))
        .collect();

    let mut tasks = Vec::with_capacity(targets.len() * 2);
    for (namespace, name) in targets {
        let labels_ns = namespace.clone();
        tasks.push(Task::new(format!("{namespace}/{name}"), move |_| async move {
            allow_garden_monitoring(seed, &labels_ns, &name).await
        }));
        tasks.push(Task::new(format!("{namespace}/{CONFIG_MAP}"), move |_| async move {
            rewrite_scrape_targets(seed, &namespace).await
        }));
    }
    parallel("update-shoot-prometheus", cancel, tasks).await?;
    Ok(())
}

async fn allow_garden_monitoring(
    seed: &dyn SeedObjects,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let labels: serde_json::Map<String, serde_json::Value> = NETWORK_LABELS
        .iter()
        .map(|l| (l.to_string(), json!("allowed")))
        .collect();
    let patch = json!({ "spec": { "template": { "metadata": { "labels": labels } } } });
    seed.patch(SeedKind::StatefulSet, namespace, name, &patch).await
}

async fn rewrite_scrape_targets(seed: &dyn SeedObjects, namespace: &str) -> Result<(), Error> {
    let Some(config_map) = seed.get_config_map(namespace, CONFIG_MAP).await? else {
        return Ok(());
    };
    let Some(current) = config_map.data.as_ref().and_then(|d| d.get(CONFIG_KEY)) else {
        return Ok(());
    };
    let updated = current.replace(OLD_TARGET, NEW_TARGET);
    if current.is_empty() || updated == *current {
        return Ok(());
    }
    let patch = json!({ "data": { CONFIG_KEY: updated } });
    seed.patch(SeedKind::ConfigMap, namespace, CONFIG_MAP, &patch).await
}
