use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "usher_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "usher_query_duration_seconds";

/// Counter: seat holds placed (SELECT intents accepted).
pub const HOLDS_PLACED_TOTAL: &str = "usher_holds_placed_total";

/// Counter: SELECT intents rejected because another session held the seat.
pub const HOLDS_REJECTED_TOTAL: &str = "usher_holds_rejected_total";

/// Counter: holds released by their owner.
pub const HOLDS_RELEASED_TOTAL: &str = "usher_holds_released_total";

/// Counter: bookings committed.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "usher_bookings_committed_total";

/// Counter: commits rejected because a seat was already sold.
pub const BOOKING_CONFLICTS_TOTAL: &str = "usher_booking_conflicts_total";

/// Counter: seats sold across all bookings.
pub const SEATS_SOLD_TOTAL: &str = "usher_seats_sold_total";

/// Counter: seat updates published to showtime topics.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "usher_notifications_sent_total";

// ── sweep metrics ───────────────────────────────────────────────

/// Counter: holds released by the expiry sweep with an AVAILABLE broadcast.
pub const HOLDS_EXPIRED_TOTAL: &str = "usher_holds_expired_total";

/// Counter: expired holds dropped silently because the seat was booked.
pub const EXPIRY_SUPPRESSED_TOTAL: &str = "usher_expiry_suppressed_total";

/// Counter: holds evicted from sold seats by the reconciliation sweep.
pub const RECONCILE_CORRECTED_TOTAL: &str = "usher_reconcile_corrected_total";

/// Counter: holds evicted because no seat record existed.
pub const RECONCILE_INCONSISTENT_TOTAL: &str = "usher_reconcile_inconsistent_total";

/// Gauge: live holds after the latest sweep pass.
pub const HOLDS_ACTIVE: &str = "usher_holds_active";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "usher_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "usher_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "usher_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "usher_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "usher_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "usher_wal_flush_batch_size";

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
        Command::InsertSeats { .. } => "insert_seats",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdatePayment { .. } => "update_payment",
        Command::SelectSeats { .. } => "select_seats",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectShowtimes => "select_showtimes",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
