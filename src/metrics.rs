//! Prometheus metrics for the middleware stack.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `guard_requests_timed_out_total` - Requests answered with 504 by the deadline guard
//! - `guard_requests_rate_limited_total` - Requests rejected with 429
//! - `guard_panics_recovered_total` - Handler panics turned into 500 responses
//!
//! ## Histograms
//! - `guard_request_duration_seconds` - Request duration (labels: method, status)
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder,
//! so middleware can call them unconditionally.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TIMED_OUT_TOTAL: &str = "guard_requests_timed_out_total";
    pub const REQUESTS_RATE_LIMITED_TOTAL: &str = "guard_requests_rate_limited_total";
    pub const PANICS_RECOVERED_TOTAL: &str = "guard_panics_recovered_total";
    pub const REQUEST_DURATION_SECONDS: &str = "guard_request_duration_seconds";
}

/// Initialize the Prometheus metrics exporter.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TIMED_OUT_TOTAL,
        "Total number of requests that exceeded their deadline"
    );
    describe_counter!(
        names::REQUESTS_RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::PANICS_RECOVERED_TOTAL,
        "Total number of handler panics recovered"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_request_timed_out() {
    counter!(names::REQUESTS_TIMED_OUT_TOTAL).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::REQUESTS_RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_panic_recovered() {
    counter!(names::PANICS_RECOVERED_TOTAL).increment(1);
}

pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}
