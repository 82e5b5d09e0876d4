use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

/// Counter: bookings granted.
pub const BOOKINGS_GRANTED_TOTAL: &str = "parkd_bookings_granted_total";

/// Counter: bookings rejected for lack of availability.
pub const BOOKINGS_REJECTED_TOTAL: &str = "parkd_bookings_rejected_total";

/// Counter: slots returned to free by the reclaim sweep.
pub const SLOTS_RECLAIMED_TOTAL: &str = "parkd_slots_reclaimed_total";

/// Counter: manual owner overrides (audit trail for freeSlot).
pub const SLOT_OVERRIDES_TOTAL: &str = "parkd_slot_overrides_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Gauge: number of provisioned lots.
pub const LOTS_ACTIVE: &str = "parkd_lots_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::ProvisionLot { .. } => "provision_lot",
        Command::Book { .. } => "book",
        Command::FreeSlot { .. } => "free_slot",
        Command::SelectLots => "select_lots",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
    }
}
