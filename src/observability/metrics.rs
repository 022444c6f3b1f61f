//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, route, status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_rate_limited_total` (counter): rejected admissions by scope
//! - `gateway_breaker_transitions_total` (counter): breaker state changes
//! - `gateway_cache_lookups_total` (counter): hits/misses per tier
//! - `gateway_cache_degraded_total` (counter): distributed-tier failures
//! - `gateway_registry_refresh_failures_total` (counter)
//! - `gateway_instances` (gauge): instances in the latest snapshot
//!
//! # Design Decisions
//! - Uses the `metrics` facade; recording is a no-op until `init_metrics` runs
//! - Labels for route, service, status code

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished inbound request.
pub fn record_request(method: &str, route: &str, status: u16, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];
    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

/// Record a request rejected by a token bucket.
pub fn record_rate_limited(scope: &str) {
    counter!("gateway_rate_limited_total", "scope" => scope.to_string()).increment(1);
}

/// Record a breaker state change.
pub fn record_breaker_transition(service: &str, to: &'static str) {
    counter!(
        "gateway_breaker_transitions_total",
        "service" => service.to_string(),
        "to" => to
    )
    .increment(1);
}

/// Record a lookup in one cache tier.
pub fn record_cache_lookup(tier: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("gateway_cache_lookups_total", "tier" => tier, "result" => result).increment(1);
}

/// Record a distributed-tier error or timeout that degraded to a miss.
pub fn record_cache_degraded(tier: &'static str, op: &'static str) {
    counter!("gateway_cache_degraded_total", "tier" => tier, "op" => op).increment(1);
}

pub fn record_registry_refresh_failure(service: &str) {
    counter!("gateway_registry_refresh_failures_total", "service" => service.to_string()).increment(1);
}

pub fn record_instances(service: &str, count: usize) {
    gauge!("gateway_instances", "service" => service.to_string()).set(count as f64);
}

/// Post-hoc timing/status middleware for every inbound request.
pub async fn track_metrics(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    record_request(&method, &route, response.status().as_u16(), start);
    response
}
