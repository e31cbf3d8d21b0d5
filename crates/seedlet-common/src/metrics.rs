//! Metrics registry for seedlet observability
//!
//! Provides OpenTelemetry metrics for:
//! - Lifecycle phase transitions
//! - Credential bootstrap and rotation
//! - Task-flow execution
//! - Cache sync latency
//! - Periodic health

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("seedlet"));

// ============================================================================
// Lifecycle
// ============================================================================

/// Counter of lifecycle phase transitions
///
/// Labels:
/// - `phase`: idle, bootstrapping, running, stopped, failed
pub static LIFECYCLE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("seedlet_lifecycle_transitions_total")
        .with_description("Lifecycle phase transitions")
        .with_unit("{transitions}")
        .build()
});

/// Gauge that is 1 while periodic health is ok
pub static SEED_HEALTHY: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("seedlet_seed_healthy")
        .with_description("1 when the seed lease heartbeat is current")
        .build()
});

// ============================================================================
// Credentials
// ============================================================================

/// Counter of certificate signing requests by outcome
///
/// Labels:
/// - `result`: approved, denied, failed, timeout
pub static CSR_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("seedlet_csr_requests_total")
        .with_description("Certificate signing requests submitted to the garden")
        .with_unit("{requests}")
        .build()
});

/// Seconds until the garden client certificate expires
pub static CERTIFICATE_EXPIRY: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("seedlet_garden_certificate_expiry_seconds")
        .with_description("Seconds until the garden client certificate expires")
        .with_unit("s")
        .build()
});

// ============================================================================
// Flows and caches
// ============================================================================

/// Histogram of flow duration
///
/// Labels:
/// - `flow`: flow name
/// - `result`: success, error
pub static FLOW_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("seedlet_flow_duration_seconds")
        .with_description("Duration of task flows in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed flow tasks
///
/// Labels:
/// - `flow`: flow name
pub static FLOW_TASK_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("seedlet_flow_task_errors_total")
        .with_description("Tasks that returned an error inside a flow")
        .with_unit("{errors}")
        .build()
});

/// Histogram of cache sync duration
pub static CACHE_SYNC_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("seedlet_cache_sync_duration_seconds")
        .with_description("Time until all informer caches reported synced")
        .with_unit("s")
        .build()
});

/// Times a flow and records its outcome
pub struct FlowTimer {
    flow: String,
    start: std::time::Instant,
}

impl FlowTimer {
    /// Start timing a flow
    pub fn start(flow: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record completion; `failed_tasks` is zero on success
    pub fn finish(self, failed_tasks: usize) {
        let result = if failed_tasks == 0 { "success" } else { "error" };
        FLOW_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("flow", self.flow.clone()),
                KeyValue::new("result", result),
            ],
        );
        if failed_tasks > 0 {
            FLOW_TASK_ERRORS.add(failed_tasks as u64, &[KeyValue::new("flow", self.flow)]);
        }
    }
}

/// Record a lifecycle phase transition
pub fn record_phase(phase: &'static str) {
    LIFECYCLE_TRANSITIONS.add(1, &[KeyValue::new("phase", phase)]);
}

/// Record a CSR outcome
pub fn record_csr(result: &'static str) {
    CSR_REQUESTS.add(1, &[KeyValue::new("result", result)]);
}

/// Update the seed health gauge
pub fn set_seed_healthy(healthy: bool) {
    SEED_HEALTHY.record(i64::from(healthy), &[]);
}
