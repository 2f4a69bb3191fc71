use std::net::SocketAddr;

use crate::wire::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "gearbook_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "gearbook_request_duration_seconds";

// ── Domain ──────────────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "gearbook_reservations_created_total";

/// Counter: creates/edits rejected for overlap.
pub const CONFLICTS_TOTAL: &str = "gearbook_conflicts_total";

/// Counter. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "gearbook_transitions_total";

/// Counter. Labels: op.
pub const REVIEWS_TOTAL: &str = "gearbook_reviews_total";

/// Counter: reservations moved to overdue by the sweeper.
pub const OVERDUE_SWEPT_TOTAL: &str = "gearbook_overdue_swept_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "gearbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "gearbook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gearbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gearbook_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "gearbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a request.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateReservation(_) => "create_reservation",
        Command::GetReservation(_) => "get_reservation",
        Command::ListReservations(_) => "list_reservations",
        Command::UpdateReservation(_) => "update_reservation",
        Command::Transition(_) => "transition",
        Command::DeleteReservation(_) => "delete_reservation",
        Command::CheckInterval(_) => "check_interval",
        Command::CanReview(_) => "can_review",
        Command::CreateReview(_) => "create_review",
        Command::GetReview(_) => "get_review",
        Command::ListReviews(_) => "list_reviews",
        Command::UpdateReview(_) => "update_review",
        Command::DeleteReview(_) => "delete_review",
        Command::EquipmentRating(_) => "equipment_rating",
        Command::Listen(_) => "listen",
        Command::Unlisten(_) => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
