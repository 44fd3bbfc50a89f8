//! Observability infrastructure for the scheduling bridge
//!
//! Provides:
//! - Prometheus metrics (submissions, bindings, failures, sweep duration)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sweep duration (in seconds)
const SWEEP_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<BridgeMetricsInner> = OnceLock::new();

struct BridgeMetricsInner {
    jobs_submitted: IntCounter,
    pods_bound: IntCounter,
    fit_errors: IntCounter,
    bind_errors: IntCounter,
    placement_failures: IntCounter,
    watch_reconnects: IntCounter,
    sweep_duration_seconds: Histogram,
    unscheduled_pods: IntGauge,
}

impl BridgeMetricsInner {
    fn new() -> Self {
        Self {
            jobs_submitted: register_int_counter!(
                "pbs_bridge_jobs_submitted_total",
                "Batch jobs submitted on behalf of pods"
            )
            .expect("Failed to register jobs_submitted"),

            pods_bound: register_int_counter!(
                "pbs_bridge_pods_bound_total",
                "Pods bound to the node chosen by the batch scheduler"
            )
            .expect("Failed to register pods_bound"),

            fit_errors: register_int_counter!(
                "pbs_bridge_fit_errors_total",
                "Fit attempts that ended in an error"
            )
            .expect("Failed to register fit_errors"),

            bind_errors: register_int_counter!(
                "pbs_bridge_bind_errors_total",
                "Bind attempts that ended in an error"
            )
            .expect("Failed to register bind_errors"),

            placement_failures: register_int_counter!(
                "pbs_bridge_placement_failures_total",
                "Jobs reported by the batch scheduler as unable to place"
            )
            .expect("Failed to register placement_failures"),

            watch_reconnects: register_int_counter!(
                "pbs_bridge_watch_reconnects_total",
                "Pod watch connections re-established after a failure"
            )
            .expect("Failed to register watch_reconnects"),

            sweep_duration_seconds: register_histogram!(
                "pbs_bridge_sweep_duration_seconds",
                "Time spent in one full sweep of unscheduled pods",
                SWEEP_BUCKETS.to_vec()
            )
            .expect("Failed to register sweep_duration_seconds"),

            unscheduled_pods: register_int_gauge!(
                "pbs_bridge_unscheduled_pods",
                "Unscheduled pods seen by the last sweep"
            )
            .expect("Failed to register unscheduled_pods"),
        }
    }
}

/// Bridge metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct BridgeMetrics {
    _private: (),
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BridgeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BridgeMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_jobs_submitted(&self) {
        self.inner().jobs_submitted.inc();
    }

    pub fn inc_pods_bound(&self) {
        self.inner().pods_bound.inc();
    }

    pub fn inc_fit_errors(&self) {
        self.inner().fit_errors.inc();
    }

    pub fn inc_bind_errors(&self) {
        self.inner().bind_errors.inc();
    }

    pub fn inc_placement_failures(&self) {
        self.inner().placement_failures.inc();
    }

    pub fn inc_watch_reconnects(&self) {
        self.inner().watch_reconnects.inc();
    }

    pub fn observe_sweep_duration(&self, duration_secs: f64) {
        self.inner().sweep_duration_seconds.observe(duration_secs);
    }

    pub fn set_unscheduled_pods(&self, count: i64) {
        self.inner().unscheduled_pods.set(count);
    }
}

/// Structured logger for bridge lifecycle events
///
/// Emits one JSON record with a stable `event` field per significant fact,
/// so operators can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, api_server: &str) {
        info!(
            event = "bridge_started",
            component = %self.component,
            version = %version,
            api_server = %api_server,
            "Scheduling bridge started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "bridge_shutdown",
            component = %self.component,
            reason = %reason,
            "Scheduling bridge shutting down"
        );
    }

    pub fn log_job_submitted(&self, pod: &str, job_id: &str, select: &str) {
        info!(
            event = "job_submitted",
            component = %self.component,
            pod = %pod,
            job_id = %job_id,
            select = %select,
            "Submitted batch job for pod"
        );
    }

    pub fn log_pod_bound(&self, pod: &str, job_id: Option<&str>, node: &str) {
        info!(
            event = "pod_bound",
            component = %self.component,
            pod = %pod,
            job_id = ?job_id,
            node = %node,
            "Pod bound to batch-assigned node"
        );
    }

    pub fn log_placement_failed(&self, pod: &str, job_id: &str, comment: Option<&str>) {
        warn!(
            event = "placement_failed",
            component = %self.component,
            pod = %pod,
            job_id = %job_id,
            comment = ?comment,
            "Batch scheduler cannot place job"
        );
    }
}
