use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: availability queries answered.
pub const AVAILABILITY_QUERIES_TOTAL: &str = "sprocket_availability_queries_total";

/// Histogram: availability query latency in seconds.
pub const AVAILABILITY_QUERY_DURATION_SECONDS: &str = "sprocket_availability_query_duration_seconds";

/// Counter: bookings committed.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "sprocket_bookings_committed_total";

/// Counter: bookings rejected. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "sprocket_bookings_rejected_total";

/// Counter: optimistic commit retries after a version conflict.
pub const BOOKING_COMMIT_RETRIES_TOTAL: &str = "sprocket_booking_commit_retries_total";

/// Counter: reservations canceled.
pub const CANCELLATIONS_TOTAL: &str = "sprocket_cancellations_total";

/// Counter: manual stock adjustments applied.
pub const STOCK_ADJUSTMENTS_TOTAL: &str = "sprocket_stock_adjustments_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "sprocket_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "sprocket_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
