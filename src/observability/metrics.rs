//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fleet_mutations_total` (counter): document mutations by `op`, `result`
//! - `fleet_process_starts_total` (counter): spawned client processes
//! - `fleet_process_stops_total` (counter): stopped processes by `forced`
//! - `fleet_reloads_total` (counter): hot reloads by `result`
//! - `fleet_running_processes` (gauge): processes currently running
//!
//! Recording is a no-op until a recorder is installed, so library users and
//! tests pay nothing.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const MUTATIONS_TOTAL: &str = "fleet_mutations_total";
pub const PROCESS_STARTS_TOTAL: &str = "fleet_process_starts_total";
pub const PROCESS_STOPS_TOTAL: &str = "fleet_process_stops_total";
pub const RELOADS_TOTAL: &str = "fleet_reloads_total";
pub const RUNNING_PROCESSES: &str = "fleet_running_processes";

/// Install the Prometheus recorder and its scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "metrics endpoint listening");
    Ok(())
}

pub fn record_mutation(op: &'static str, ok: bool) {
    counter!(MUTATIONS_TOTAL, "op" => op, "result" => result_label(ok)).increment(1);
}

pub fn record_process_start() {
    counter!(PROCESS_STARTS_TOTAL).increment(1);
}

pub fn record_process_stop(forced: bool) {
    counter!(PROCESS_STOPS_TOTAL, "forced" => if forced { "true" } else { "false" }).increment(1);
}

pub fn record_reload(ok: bool) {
    counter!(RELOADS_TOTAL, "result" => result_label(ok)).increment(1);
}

pub fn set_running_processes(count: usize) {
    gauge!(RUNNING_PROCESSES).set(count as f64);
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}
