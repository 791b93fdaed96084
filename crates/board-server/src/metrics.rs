//! Metrics collection and export for Board.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "board_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "board_connections_active";
    pub const SUBSCRIBERS_ACTIVE: &str = "board_subscribers_active";
    pub const POSTS_TOTAL: &str = "board_posts_total";
    pub const DELETES_TOTAL: &str = "board_deletes_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "board_events_published_total";
    pub const FRAMES_TOTAL: &str = "board_frames_total";
    pub const STORE_LATENCY_SECONDS: &str = "board_store_latency_seconds";
    pub const ERRORS_TOTAL: &str = "board_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of live connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open live connections"
    );
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of registered subscribers"
    );
    metrics::describe_counter!(
        names::POSTS_TOTAL,
        "Posts received, labelled accepted or rejected"
    );
    metrics::describe_counter!(names::DELETES_TOTAL, "Delete requests processed");
    metrics::describe_counter!(
        names::EVENTS_PUBLISHED_TOTAL,
        "Events fanned out, labelled by event name"
    );
    metrics::describe_counter!(
        names::FRAMES_TOTAL,
        "Live-channel frames, labelled by direction"
    );
    metrics::describe_histogram!(
        names::STORE_LATENCY_SECONDS,
        "Write-and-publish latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Update the registered subscriber count.
pub fn set_active_subscribers(count: usize) {
    gauge!(names::SUBSCRIBERS_ACTIVE).set(count as f64);
}

/// Record a post, accepted or dropped by validation.
pub fn record_post(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!(names::POSTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a processed delete.
pub fn record_delete() {
    counter!(names::DELETES_TOTAL).increment(1);
}

/// Record a published event.
pub fn record_event(name: &'static str) {
    counter!(names::EVENTS_PUBLISHED_TOTAL, "event" => name).increment(1);
}

/// Record a live-channel frame.
pub fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

/// Record write-and-publish latency.
pub fn record_store_latency(seconds: f64) {
    histogram!(names::STORE_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
