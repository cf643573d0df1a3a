use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spacebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spacebook_query_duration_seconds";

/// Counter: reservation mutations. Labels: operation, outcome.
pub const RESERVATIONS_TOTAL: &str = "spacebook_reservations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spacebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spacebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spacebook_connections_rejected_total";

/// Counter: startup user could not be resolved to an actor.
pub const AUTH_FAILURES_TOTAL: &str = "spacebook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spacebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spacebook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "spacebook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::SaveBuilding { .. } => "save_building",
        Command::SaveFloor { .. } => "save_floor",
        Command::SaveSpace { .. } => "save_space",
        Command::SaveUser { .. } => "save_user",
        Command::DeactivateBuilding { .. } => "deactivate_building",
        Command::DeactivateFloor { .. } => "deactivate_floor",
        Command::DeactivateSpace { .. } => "deactivate_space",
        Command::CreateReservation(_) => "create_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectOccupancy { .. } => "select_occupancy",
    }
}

/// Map an engine rejection to a short outcome label for metrics.
pub fn error_label(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "invalid",
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "duplicate",
        EngineError::SpaceUnavailable(_) => "unavailable",
        EngineError::ScheduleConflict(_) => "conflict",
        EngineError::QuotaExceeded { .. } => "quota",
        EngineError::Forbidden => "forbidden",
        EngineError::InvalidState(_) => "invalid_state",
        EngineError::HasActiveReservations(_) => "has_active",
        EngineError::LimitExceeded(_) => "limit",
        EngineError::StoreFailure(_) => "store_failure",
    }
}
