use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "curlbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "curlbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "curlbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "curlbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "curlbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "curlbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "curlbook_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "curlbook_wal_compactions_total";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings created, single and recurring.
pub const BOOKINGS_CREATED_TOTAL: &str = "curlbook_bookings_created_total";

/// Counter: dates a recurring rule produced but that failed validation.
pub const RECURRING_DATES_SKIPPED_TOTAL: &str = "curlbook_recurring_dates_skipped_total";

/// Counter: candidate bookings rejected. Labels: reason.
pub const VALIDATION_REJECTIONS_TOTAL: &str = "curlbook_validation_rejections_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertArea { .. } => "upsert_area",
        Command::DeleteArea { .. } => "delete_area",
        Command::UpsertAvailability { .. } => "upsert_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::UpsertBooking { .. } => "upsert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::UpsertPattern { .. } => "upsert_pattern",
        Command::DeletePattern { .. } => "delete_pattern",
        Command::SelectAreas => "select_areas",
        Command::SelectAvailabilities { .. } => "select_availabilities",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectPatternBookings { .. } => "select_pattern_bookings",
        Command::SelectBookable { .. } => "select_bookable",
        Command::SelectRecurrence { .. } => "select_recurrence",
    }
}
