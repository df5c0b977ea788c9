use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

// ── Ledger ──────────────────────────────────────────────────────

/// Counter: appointments booked.
pub const BOOKINGS_TOTAL: &str = "slotd_bookings_total";

/// Counter: bookings rejected because the slot was not free.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";

/// Counter: appointments and unproductive marks dropped by retention.
pub const RETENTION_PURGED_TOTAL: &str = "slotd_retention_purged_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Counter: queries refused because the login maps to no session.
pub const AUTH_FAILURES_TOTAL: &str = "slotd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

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
        Command::InsertInspector { .. } => "insert_inspector",
        Command::UpdateInspector { .. } => "update_inspector",
        Command::DeleteInspector { .. } => "delete_inspector",
        Command::InsertTemplate { .. } => "insert_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::SetOverride { .. } => "set_override",
        Command::ClearOverride { .. } => "clear_override",
        Command::InsertClient { .. } => "insert_client",
        Command::DeleteClient { .. } => "delete_client",
        Command::InsertAgency { .. } => "insert_agency",
        Command::DeleteAgency { .. } => "delete_agency",
        Command::InsertProperty { .. } => "insert_property",
        Command::DeleteProperty { .. } => "delete_property",
        Command::InsertAppointment { .. } => "book",
        Command::DeleteAppointment { .. } => "cancel",
        Command::MarkUnproductive { .. } => "mark_unproductive",
        Command::PayCharge { .. } => "pay_charge",
        Command::ResetSlot { .. } => "reset_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectCharges { .. } => "select_charges",
        Command::SelectInspectors => "select_inspectors",
        Command::SelectTemplates { .. } => "select_templates",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectClients => "select_clients",
        Command::SelectAgencies => "select_agencies",
        Command::SelectProperties => "select_properties",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
