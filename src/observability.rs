use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: single admissions. Labels: outcome (admitted, conflict, rejected).
pub const ADMISSIONS_TOTAL: &str = "roomy_admissions_total";

/// Counter: series admissions. Labels: outcome (admitted, partial_conflict, rejected).
pub const SERIES_ADMISSIONS_TOTAL: &str = "roomy_series_admissions_total";

/// Counter: reservation status transitions. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "roomy_reservation_transitions_total";

/// Histogram: admission latency in seconds, lock wait included. Labels: kind (single, series).
pub const ADMISSION_DURATION_SECONDS: &str = "roomy_admission_duration_seconds";

/// Histogram: availability query latency in seconds. Labels: entity.
pub const AVAILABILITY_DURATION_SECONDS: &str = "roomy_availability_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: location nodes held in memory.
pub const NODES_ACTIVE: &str = "roomy_nodes_active";

/// Counter: reservations cancelled by the no-show reaper.
pub const NO_SHOWS_TOTAL: &str = "roomy_no_shows_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomy_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomy_wal_flush_batch_size";

/// Counter: journal compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roomy_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install a fmt subscriber honouring `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
