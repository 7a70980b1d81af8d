//! Prometheus metrics for the gateway.
//!
//! Collectors are process-global; the `/metrics` endpoint renders the
//! default registry in text format.

use actix_web::HttpResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static! {
    /// Upstream request duration segmented by endpoint.
    pub static ref UPSTREAM_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "upstream_request_duration_seconds",
        "OSM request duration segmented by endpoint",
        &["endpoint"]
    )
    .expect("failed to register upstream_request_duration_seconds");

    /// Upstream requests by endpoint and result class.
    pub static ref UPSTREAM_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "upstream_requests_total",
        "OSM requests segmented by endpoint and outcome",
        &["endpoint", "outcome"]
    )
    .expect("failed to register upstream_requests_total");

    /// Patrol-score cache events (hit/stale_hit/miss/error).
    pub static ref SCORE_CACHE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "score_cache_events_total",
        "Patrol score cache events segmented by outcome",
        &["event"]
    )
    .expect("failed to register score_cache_events_total");

    /// Outbox entries by lifecycle event (created/completed/failed/auth_revoked).
    pub static ref OUTBOX_ENTRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "score_outbox_entries_total",
        "Outbox entries segmented by lifecycle event",
        &["event"]
    )
    .expect("failed to register score_outbox_entries_total");

    /// Rows waiting to be applied upstream.
    pub static ref OUTBOX_PENDING_DEPTH: IntGauge = register_int_gauge!(
        "score_outbox_pending_depth",
        "Outbox rows in pending or processing state"
    )
    .expect("failed to register score_outbox_pending_depth");

    /// Device token-poll outcomes.
    pub static ref DEVICE_POLL_TOTAL: IntCounterVec = register_int_counter_vec!(
        "device_poll_total",
        "Device token polls segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register device_poll_total");

    /// 1 while the upstream has flagged the whole service as blocked.
    pub static ref SERVICE_BLOCKED: IntGauge = register_int_gauge!(
        "upstream_service_blocked",
        "Whether the upstream currently blocks the whole service"
    )
    .expect("failed to register upstream_service_blocked");
}

/// Actix handler that renders Prometheus metrics in text format.
pub async fn serve_metrics() -> HttpResponse {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
