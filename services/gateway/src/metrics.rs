//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `dialect`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `dialect`
//! - `gateway_rotations_total` (counter): label `outcome`
//! - `gateway_transport_faults_total` (counter)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `gateway_request_duration_seconds` gets explicit buckets so it renders
/// as a histogram with `_bucket` lines rather than the default summary.
/// The range runs from 10ms to 600s: generative requests routinely take
/// minutes.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_request_duration_seconds".to_string(),
            ),
            &[
                0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with its dialect and final status.
pub fn record_request(status: u16, dialect: &str, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "dialect" => dialect.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "dialect" => dialect.to_string())
        .record(duration_secs);
}

/// Record a channel-level fault (send failure or closed channel).
pub fn record_transport_fault() {
    metrics::counter!("gateway_transport_faults_total").increment(1);
}

/// In-process counters surfaced on the health endpoint.
pub struct ServiceMetrics {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub in_flight: AtomicU64,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "errors_total": self.errors_total.load(Ordering::Relaxed),
            "in_flight": self.in_flight.load(Ordering::Relaxed),
            "uptime_secs": self.uptime_secs(),
        })
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // When no recorder is installed, metrics calls are no-ops.
        record_request(200, "native", 1.2);
        record_transport_fault();
    }

    /// Create an isolated recorder/handle pair for unit tests. Only one
    /// global recorder can exist per process, so install_recorder() is
    /// off limits here.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "gateway_request_duration_seconds".to_string(),
                ),
                &[
                    0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
                ],
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "native", 2.5);
        record_request(503, "openai", 0.1);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("dialect=\"native\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("dialect=\"openai\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines for histogram_quantile() queries"
        );
    }

    #[test]
    fn transport_fault_counter_renders() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_transport_fault();
        record_transport_fault();

        let output = handle.render();
        assert!(output.contains("gateway_transport_faults_total 2"));
    }

    #[test]
    fn histogram_buckets_cover_generative_latency() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "native", 45.0);

        let output = handle.render();
        assert!(output.contains("le=\"0.01\""));
        assert!(output.contains("le=\"600\""), "10-minute bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn service_metrics_snapshot() {
        let m = ServiceMetrics::new();
        m.requests_total.fetch_add(3, Ordering::Relaxed);
        m.errors_total.fetch_add(1, Ordering::Relaxed);

        let snap = m.snapshot();
        assert_eq!(snap["requests_total"], 3);
        assert_eq!(snap["errors_total"], 1);
        assert_eq!(snap["in_flight"], 0);
    }
}
