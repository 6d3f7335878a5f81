use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine mutations issued. Labels: op, status.
pub const MUTATIONS_TOTAL: &str = "shiftbook_mutations_total";

/// Histogram: store round-trip of a mutation in seconds. Labels: op.
pub const MUTATION_DURATION_SECONDS: &str = "shiftbook_mutation_duration_seconds";

/// Counter: mutations rejected before any I/O. Labels: reason.
pub const VALIDATION_REJECTIONS_TOTAL: &str = "shiftbook_validation_rejections_total";

/// Counter: writes that pushed a slot over its ceiling. Labels: policy.
pub const CAPACITY_VIOLATIONS_TOTAL: &str = "shiftbook_capacity_violations_total";

// ── Sync metrics ────────────────────────────────────────────────

/// Counter: snapshots applied to canonical state.
pub const SNAPSHOTS_APPLIED_TOTAL: &str = "shiftbook_snapshots_applied_total";

/// Counter: snapshots dropped because a newer revision was already applied.
pub const SNAPSHOTS_STALE_TOTAL: &str = "shiftbook_snapshots_stale_total";

/// Counter: store records that failed to decode and were skipped.
pub const RECORDS_SKIPPED_TOTAL: &str = "shiftbook_records_skipped_total";

/// Gauge: reservations in the canonical view.
pub const RESERVATIONS_CANONICAL: &str = "shiftbook_reservations_canonical";

/// Counter: notification intents. Labels: outcome (emitted, initial_load, local_echo, failed).
pub const NOTIFICATIONS_TOTAL: &str = "shiftbook_notifications_total";

// ── Store metrics ───────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shiftbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shiftbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record the outcome of one engine mutation.
pub fn record_mutation(op: &'static str, ok: bool, seconds: f64) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(MUTATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(MUTATION_DURATION_SECONDS, "op" => op).record(seconds);
}
