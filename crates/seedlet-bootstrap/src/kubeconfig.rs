//! Kubeconfig payloads for the garden connection

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::Kubeconfig;
use serde_json::json;

use seedlet_common::Error;

/// Key under which secrets carry the kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const CONTEXT_NAME: &str = "garden";

/// API server endpoint and trust settings of a kubeconfig's current context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEndpoint {
    /// API server URL
    pub server: String,
    /// Base64 CA bundle, when present
    pub certificate_authority_data: Option<String>,
    /// Skip TLS verification
    pub insecure_skip_tls_verify: bool,
}

/// Parse a kubeconfig document
pub fn parse(data: &[u8]) -> Result<Kubeconfig, Error> {
    let text = std::str::from_utf8(data).map_err(|e| {
        Error::serialization_for_kind("Kubeconfig", format!("kubeconfig is not UTF-8: {e}"))
    })?;
    Kubeconfig::from_yaml(text).map_err(|e| {
        Error::serialization_for_kind("Kubeconfig", format!("invalid kubeconfig: {e}"))
    })
}

/// Endpoint of the current context
pub fn endpoint(config: &Kubeconfig) -> Result<ClusterEndpoint, Error> {
    let context = current_context(config)?;
    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| {
            Error::config("kubeconfig", format!("cluster {} not found", context.cluster))
        })?;
    let server = cluster
        .server
        .clone()
        .ok_or_else(|| Error::config("kubeconfig", "cluster has no server"))?;

    Ok(ClusterEndpoint {
        server,
        certificate_authority_data: cluster.certificate_authority_data.clone(),
        insecure_skip_tls_verify: cluster.insecure_skip_tls_verify.unwrap_or(false),
    })
}

/// PEM client certificate of the current context, if it uses one
pub fn client_certificate(config: &Kubeconfig) -> Result<Option<Vec<u8>>, Error> {
    let context = current_context(config)?;
    let Some(user) = context.user.as_deref() else {
        return Ok(None);
    };
    let data = config
        .auth_infos
        .iter()
        .find(|a| a.name == user)
        .and_then(|a| a.auth_info.as_ref())
        .and_then(|a| a.client_certificate_data.clone());

    data.map(|b64| {
        STANDARD.decode(b64.trim()).map_err(|e| {
            Error::serialization_for_kind(
                "Kubeconfig",
                format!("client certificate is not base64: {e}"),
            )

        })
    })
    .transpose()
}

/// Render a kubeconfig that authenticates with a client certificate
pub fn render(
    endpoint: &ClusterEndpoint,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut cluster = json!({ "server": endpoint.server });
    if let Some(ca) = &endpoint.certificate_authority_data {
        cluster["certificate-authority-data"] = json!(ca);
    }
    if endpoint.insecure_skip_tls_verify {
        cluster["insecure-skip-tls-verify"] = json!(true);
    }

    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": CONTEXT_NAME,
        "clusters": [{ "name": CONTEXT_NAME, "cluster": cluster }],
        "users": [{
            "name": CONTEXT_NAME,
            "user": {
                "client-certificate-data": STANDARD.encode(cert_pem),
                "client-key-data": STANDARD.encode(key_pem),
            }
        }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CONTEXT_NAME, "user": CONTEXT_NAME }
        }],
    });
    Ok(serde_yaml::to_string(&doc)?.into_bytes())
}

fn current_context(config: &Kubeconfig) -> Result<&kube::config::Context, Error> {
    let name = config
        .current_context
        .as_deref()
        .or_else(|| config.contexts.first().map(|c| c.name.as_str()))
        .ok_or_else(|| Error::config("kubeconfig", "no contexts"))?;
    config
        .contexts
        .iter()
        .find(|c| c.name == name)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| Error::config("kubeconfig", format!("context {name} not found")))
}
