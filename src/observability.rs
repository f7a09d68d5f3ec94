use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "rentd_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "rentd_command_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings requested.
pub const BOOKINGS_CREATED_TOTAL: &str = "rentd_bookings_created_total";

/// Counter: approval decisions applied. Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "rentd_booking_transitions_total";

/// Counter: bookings deleted by their renter.
pub const BOOKINGS_DELETED_TOTAL: &str = "rentd_bookings_deleted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Gauge: number of loaded marketplaces.
pub const TENANTS_ACTIVE: &str = "rentd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

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
        Command::InsertItem { .. } => "insert_item",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::ApproveBooking { .. } => "approve_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { perspective: crate::model::Perspective::Renter, .. } => {
            "select_bookings"
        }
        Command::SelectBookings { perspective: crate::model::Perspective::Owner, .. } => {
            "select_owner_bookings"
        }
        Command::InsertComment { .. } => "insert_comment",
        Command::SelectComments { .. } => "select_comments",
        Command::SelectItem { .. } => "select_item",
        Command::SelectItems { .. } => "select_items",
    }
}
