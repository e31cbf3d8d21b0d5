//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, polling, JSON merge-patch computation and the small
//! label/annotation helpers used by registration and maintenance.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll `check_fn` until it returns `Ok(true)`.
///
/// Errors from `check_fn` are fatal and returned as-is; callers map the
/// statuses they consider "not yet" to `Ok(false)`. Times out with an
/// internal error carrying `timeout_msg`, and stops with
/// [`Error::Cancelled`] when `cancel` fires.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if check_fn().await? {
            return Ok(());
        }
        trace!("Polling condition not yet met, retrying...");

        if start.elapsed() + poll_interval > timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(timeout_msg)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
///
/// Without a path the config is inferred (in-cluster, then `$KUBECONFIG`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    client_from_config(config)
}

/// Create a kube client from an in-memory kubeconfig (e.g. one read from a secret)
pub async fn create_client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("invalid kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    client_from_config(config)
}

fn client_from_config(config: Config) -> Result<Client, Error> {
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Compute an RFC 7386 JSON merge patch that turns `original` into `modified`.
///
/// Keys present only in `original` are set to `null`, nested objects are
/// diffed recursively and every other changed value is replaced wholesale.
/// Returns an empty object when nothing changed.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => Value::Object(diff_objects(orig, modi)),
        _ => modified.clone(),
    }
}

fn diff_objects(orig: &Map<String, Value>, modi: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for key in orig.keys() {
        if !modi.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, new) in modi {
        match orig.get(key) {
            Some(old) if old == new => {}
            Some(Value::Object(old)) if new.is_object() => {
                if let Value::Object(new) = new {
                    let nested = diff_objects(old, new);
                    if !nested.is_empty() {
                        patch.insert(key.clone(), Value::Object(nested));
                    }
                }
            }
            _ => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }
    patch
}

/// True if a merge patch would not change anything
pub fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(m) if m.is_empty())
}

/// Union `desired` into `existing`; desired values win, foreign keys survive
pub fn merge_string_maps(
    existing: Option<&BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (existing, desired) {
        (None, None) => None,
        (e, d) => {
            let mut merged = e.cloned().unwrap_or_default();
            if let Some(d) = d {
                merged.extend(d.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(merged)
        }
    }
}

/// Short stable SHA-256 hex digest, used for object-name suffixes
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Format a selector string from a label map (`k1=v1,k2=v2`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
