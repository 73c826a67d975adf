use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "inspecta_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "inspecta_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: committed appointment writes. Labels: event.
pub const APPOINTMENT_WRITES_TOTAL: &str = "inspecta_appointment_writes_total";

/// Counter: overlapping appointments found while evaluating a write.
pub const CONFLICTS_DETECTED_TOTAL: &str = "inspecta_conflicts_detected_total";

/// Counter: writes refused under the reject policy.
pub const CONFLICT_REJECTIONS_TOTAL: &str = "inspecta_conflict_rejections_total";

/// Counter: backups that failed after every retry. Labels: sink.
pub const BACKUP_FAILURES_TOTAL: &str = "inspecta_backup_failures_total";

/// Histogram: time to land a successful backup, retries included.
pub const BACKUP_DURATION_SECONDS: &str = "inspecta_backup_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "inspecta_connections_active";
pub const CONNECTIONS_TOTAL: &str = "inspecta_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "inspecta_connections_rejected_total";

/// Gauge: organizations with a loaded engine.
pub const TENANTS_ACTIVE: &str = "inspecta_tenants_active";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "inspecta_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "inspecta_wal_flush_batch_size";

/// Install the Prometheus exporter. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::SetStatus { .. } => "set_status",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectWorkload { .. } => "select_workload",
    }
}
