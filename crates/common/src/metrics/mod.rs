//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for turn orchestration with standardized
//! naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all StoreSage metrics
pub const METRICS_PREFIX: &str = "storesage";

/// Histogram buckets for turn latency (in seconds)
/// Turns chain several external calls, so the range is wide.
pub const TURN_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 60s
];

/// Buckets for a single external call
pub const CALL_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    5.000, // 5s
    20.00, // 20s
];

/// Histograms exported with explicit buckets, by full metric name
pub fn histogram_buckets() -> [(String, &'static [f64]); 2] {
    [
        (format!("{}_turn_duration_seconds", METRICS_PREFIX), TURN_BUCKETS),
        (format!("{}_external_call_duration_seconds", METRICS_PREFIX), CALL_BUCKETS),
    ]
}

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_turns_total", METRICS_PREFIX),
        Unit::Count,
        "Total orchestrated turns by archetype and outcome"
    );

    describe_histogram!(
        format!("{}_turn_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end turn latency in seconds"
    );

    describe_counter!(
        format!("{}_external_calls_total", METRICS_PREFIX),
        Unit::Count,
        "External service calls by component and status"
    );

    describe_histogram!(
        format!("{}_external_call_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "External service call latency in seconds"
    );

    describe_counter!(
        format!("{}_external_call_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Failed external service calls"
    );

    describe_counter!(
        format!("{}_external_call_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Retried external service calls"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a finished turn
pub fn record_turn(duration_secs: f64, archetype: &str, outcome: &str) {
    counter!(
        format!("{}_turns_total", METRICS_PREFIX),
        "archetype" => archetype.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_turn_duration_seconds", METRICS_PREFIX),
        "archetype" => archetype.to_string()
    )
    .record(duration_secs);
}

/// Record one attempt against an external service
pub fn record_external_call(duration_secs: f64, component: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_external_calls_total", METRICS_PREFIX),
        "component" => component.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_external_call_duration_seconds", METRICS_PREFIX),
            "component" => component.to_string()
        )
        .record(duration_secs);
    } else {
        counter!(
            format!("{}_external_call_errors_total", METRICS_PREFIX),
            "component" => component.to_string()
        )
        .increment(1);
    }
}

/// Record a retry of an external call
pub fn record_retry(component: &str) {
    counter!(
        format!("{}_external_call_retries_total", METRICS_PREFIX),
        "component" => component.to_string()
    )
    .increment(1);
}
