//! Metrics and observability utilities
//!
//! Prometheus metrics for the HTTP surface, tenant database round trips and
//! module management. Names share the `minutechart_` prefix.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all minutechart metrics
pub const METRICS_PREFIX: &str = "minutechart";

/// Histogram buckets for request and statement latency (in seconds).
/// Tenant statements may run up to the command timeout, so the tail is long.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    15.00, // 15s
    30.00, // 30s
    60.00, // 60s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
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

    // Tenant database metrics
    describe_counter!(
        format!("{}_tenant_connections_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant database connection attempts"
    );

    describe_counter!(
        format!("{}_tenant_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Statements executed against tenant databases"
    );

    describe_histogram!(
        format!("{}_tenant_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Tenant statement latency in seconds"
    );

    // Module metrics
    describe_counter!(
        format!("{}_modules_saved_total", METRICS_PREFIX),
        Unit::Count,
        "Saved module inserts and updates"
    );

    describe_counter!(
        format!("{}_modules_transferred_total", METRICS_PREFIX),
        Unit::Count,
        "Modules copied between tenants"
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

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Record a tenant connection attempt
pub fn record_connection(success: bool) {
    counter!(
        format!("{}_tenant_connections_total", METRICS_PREFIX),
        "status" => outcome(success)
    )
    .increment(1);
}

/// Record one tenant statement
pub fn record_query(duration_secs: f64, success: bool) {
    counter!(
        format!("{}_tenant_queries_total", METRICS_PREFIX),
        "status" => outcome(success)
    )
    .increment(1);

    histogram!(format!("{}_tenant_query_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Record a module save; `created` distinguishes insert from update
pub fn record_module_save(created: bool) {
    let kind = if created { "insert" } else { "update" };
    counter!(
        format!("{}_modules_saved_total", METRICS_PREFIX),
        "kind" => kind
    )
    .increment(1);
}

/// Record modules written by a transfer
pub fn record_transfer(action: &str, count: usize) {
    counter!(
        format!("{}_modules_transferred_total", METRICS_PREFIX),
        "action" => action.to_string()
    )
    .increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets() {
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }

        // Command timeout must land in a bucket
        assert!(LATENCY_BUCKETS.contains(&60.0));
    }

    #[test]
    fn test_recorders_without_exporter() {
        let metrics = RequestMetrics::start("GET", "/v1/dashboard");
        metrics.finish(200);
        record_connection(false);
        record_query(0.02, true);
        record_module_save(true);
        record_transfer("replace", 3);
    }
}
