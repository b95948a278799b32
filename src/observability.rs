use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roost_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roost_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roost_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roost_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roost_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roost_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roost_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roost_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings that carved their dates and entered PENDING.
pub const BOOKINGS_REQUESTED_TOTAL: &str = "roost_bookings_requested_total";

/// Counter: lifecycle transitions applied. Labels: event.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roost_booking_transitions_total";

/// Counter: availability restores that collided with free ranges. Should stay at zero.
pub const CONSISTENCY_ERRORS_TOTAL: &str = "roost_consistency_errors_total";

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
        Command::InsertUser { .. } => "insert_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::UpdateUser { .. } => "update_user",
        Command::SelectUsers => "select_users",
        Command::SelectUser { .. } => "select_user",
        Command::InsertListing { .. } => "insert_listing",
        Command::DeleteListing { .. } => "delete_listing",
        Command::SelectListings => "select_listings",
        Command::SelectListing { .. } => "select_listing",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertBooking { .. } => "insert_booking",
        Command::TransitionBooking { .. } => "transition_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBooking { .. } => "select_booking",
        Command::ToggleFavorite { .. } => "toggle_favorite",
        Command::SelectFavorites { .. } => "select_favorites",
    }
}
