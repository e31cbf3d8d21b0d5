//! Logging and optional OTLP export
//!
//! Log lines go to stdout as JSON or text, at the configured `logLevel`
//! unless `RUST_LOG` overrides it. With `OTEL_EXPORTER_OTLP_ENDPOINT` set,
//! spans and the metrics in [`crate::metrics`] are exported over gRPC too.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, SeedletConfiguration};

/// Name reported as `service.name`
pub const SERVICE: &str = "seedlet";

/// Per-crate directives added to every level
const QUIET_DEPENDENCIES: &str = "kube=info,tower=warn,hyper=warn,rustls=warn";

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Underlying error
        message: String,
    },

    /// A global subscriber was already installed, or the filter is invalid
    #[error("failed to install log subscriber: {0}")]
    Subscriber(String),
}

/// What to set up
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Seed this agent manages; attached to exported spans and metrics
    pub seed_name: Option<String>,
    /// `debug`, `info` or `error`
    pub log_level: String,
    /// Log line encoding
    pub log_format: LogFormat,
    /// OTLP gRPC endpoint; logs only when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            seed_name: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

impl TelemetryConfig {
    /// Settings taken from the agent configuration
    pub fn from_configuration(config: &SeedletConfiguration) -> Self {
        Self {
            seed_name: Some(config.seed_name().to_string()),
            log_level: config.log_level.clone(),
            log_format: config.log_format,
            ..Default::default()
        }
    }
}

/// Filter directives for `level`; a non-empty `RUST_LOG` replaces them
pub fn log_filter(level: &str, rust_log: Option<&str>) -> String {
    match rust_log.filter(|v| !v.trim().is_empty()) {
        Some(directives) => directives.to_string(),
        None => format!("{level},seedlet={level},{QUIET_DEPENDENCIES}"),
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = resource(&config);
            install_meter_provider(endpoint, resource.clone())?;
            let tracer = install_tracer_provider(endpoint, resource)?.tracer(SERVICE);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::try_new(log_filter(&config.log_level, rust_log.as_deref()))
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    let (json, text) = match config.log_format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .with(otel)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

fn resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, SERVICE),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Some(seed) = &config.seed_name {
        attributes.push(KeyValue::new("seedlet.seed.name", seed.clone()));
    }
    for (var, key) in [("POD_NAME", "k8s.pod.name"), ("POD_NAMESPACE", "k8s.namespace.name")] {
        if let Ok(value) = std::env::var(var) {
            attributes.push(KeyValue::new(key, value));
        }
    }
    Resource::new(attributes)
}

fn install_tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn install_meter_provider(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;
    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build(),
    );
    Ok(())
}
