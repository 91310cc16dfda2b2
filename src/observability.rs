use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "allocd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "allocd_query_duration_seconds";

// ── Allocation outcomes ─────────────────────────────────────────

/// Counter: status transitions applied. Labels: entity, action, status.
pub const TRANSITIONS_TOTAL: &str = "allocd_transitions_total";

/// Counter: room bookings admitted. Labels: status (PENDING or WAITLISTED).
pub const ADMISSIONS_TOTAL: &str = "allocd_admissions_total";

/// Counter: waitlisted bookings promoted to APPROVED.
pub const PROMOTIONS_TOTAL: &str = "allocd_promotions_total";

/// Counter: submissions refused. Labels: entity, class.
pub const INTAKE_REJECTIONS_TOTAL: &str = "allocd_intake_rejections_total";

/// Counter: notices the notifier failed to deliver. Labels: kind.
pub const NOTIFY_FAILURES_TOTAL: &str = "allocd_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "allocd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "allocd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allocd_connections_rejected_total";

/// Counter: startup/auth failures. Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "allocd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "allocd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "allocd_wal_flush_batch_size";

/// Counter: WAL rewrites into a snapshot.
pub const WAL_COMPACTIONS_TOTAL: &str = "allocd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertResource { .. } => "insert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertRequest { .. } => "insert_request",
        Command::InsertBooking { .. } => "insert_booking",
        Command::ApplyAction { .. } => "apply_action",
        Command::SelectRooms => "select_rooms",
        Command::SelectResources => "select_resources",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectResourceAvailability { .. } => "select_availability",
        Command::SelectRoomConflict { .. } => "select_conflict",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectLogs { .. } => "select_logs",
    }
}
