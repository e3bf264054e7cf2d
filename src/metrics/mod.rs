//! Metrics exposition.
//!
//! The core only emits; the Prometheus exporter is the sink. Every helper is
//! fire-and-forget and never affects control flow.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus recorder")?;

    tracing::info!("Metrics listening on http://{}/metrics", addr);
    Ok(())
}

/// A replica was chosen for a job.
pub fn record_server_chosen(server: &str, job: &str) {
    counter!(
        "server_chosen",
        "server" => server.to_string(),
        "job" => job.to_string()
    )
    .increment(1);
}

/// A pooled probe was reused by a selection.
pub fn record_probe_reuse(server: &str) {
    counter!("probe_reuse_count", "server" => server.to_string()).increment(1);
}

/// A selection resolved in the hot or cold partition.
pub fn record_selection(hot: bool, server: &str) {
    let temperature = if hot { "hot" } else { "cold" };
    counter!(
        "probe_selection_total",
        "temperature" => temperature,
        "server" => server.to_string()
    )
    .increment(1);
}

/// The pool-wide RIF ceiling moved (or was re-announced after a round).
pub fn record_max_rif(max_rif: u64) {
    gauge!("probe_max_rif").set(max_rif as f64);
}

/// A probe's normalised RIF after a round's refresh.
pub fn record_normalized_rif(server: &str, normalized: f64) {
    gauge!("probe_normalized_rif", "server" => server.to_string()).set(normalized);
}

/// Probes removed by the stale/overuse purge.
pub fn record_stale_probes(count: usize) {
    counter!("probe_stale_total").increment(count as u64);
}

/// A probe attempt failed and was skipped for this round.
pub fn record_probe_failure(server: &str) {
    counter!("probe_failure_total", "server" => server.to_string()).increment(1);
}

/// Requests in flight observed by an arriving request.
pub fn record_current_rif(rif: u64) {
    gauge!("server_current_rif").set(rif as f64);
}

/// A completed application request's latency, per path.
pub fn record_request_latency(path: &'static str, latency: Duration) {
    histogram!("server_request_latency_seconds", "path" => path).record(latency.as_secs_f64());
}

/// The conditional median latency reported by the last probe answer.
pub fn record_median_latency(latency: Duration) {
    gauge!("server_median_latency_seconds").set(latency.as_secs_f64());
}
