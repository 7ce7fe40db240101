use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "courtd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtd_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "courtd_bookings_created_total";

/// Counter: booking attempts rejected because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "courtd_booking_conflicts_total";

/// Counter: check-in attempts. Labels: outcome (checked_in, already_used, not_found).
pub const CHECK_INS_TOTAL: &str = "courtd_check_ins_total";

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
        Command::SelectAvailability(_) => "select_availability",
        Command::InsertBooking(_) => "insert_booking",
        Command::SelectBookingByToken { .. } => "select_booking_by_token",
        Command::CheckIn { .. } => "check_in",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectCourts { .. } => "select_courts",
        Command::InsertCourt { .. } => "insert_court",
        Command::UpdateCourt { .. } => "update_court",
        Command::DeleteCourt { .. } => "delete_court",
    }
}
