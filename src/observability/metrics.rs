//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_transactions_total` (counter): finished transactions by outcome
//! - `proxy_transaction_duration_seconds` (histogram): accept to close
//! - `proxy_responses_total` (counter): responses sent to clients by status
//! - `proxy_tunnel_bytes_total` (counter): bytes written by sink kind
//! - `proxy_cache_lookups_total` (counter): hit-fresh, hit-stale, miss, busy, error
//! - `proxy_session_pool_events_total` (counter): reuse, connect, release, close, throttle
//! - `proxy_hook_callouts_total` (counter): by point and outcome
//! - `proxy_client_aborts_total` (counter)
//! - `proxy_background_fills_total` (counter): by result
//! - `proxy_live_transactions` (gauge)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::vc::VcKind;

/// Start the Prometheus scrape listener.
pub fn init_metrics(addr: SocketAddr) -> bool {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            tracing::info!(address = %addr, "Metrics exporter listening");
            true
        }
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter");
            false
        }
    }
}

pub fn record_transaction(outcome: &'static str, duration: Duration) {
    counter!("proxy_transactions_total", "outcome" => outcome).increment(1);
    histogram!("proxy_transaction_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_response(status: u16) {
    counter!("proxy_responses_total", "status" => status.to_string()).increment(1);
}

pub fn record_tunnel_bytes(kind: VcKind, bytes: u64) {
    if bytes > 0 {
        counter!("proxy_tunnel_bytes_total", "kind" => kind.as_str()).increment(bytes);
    }
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("proxy_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_pool_event(event: &'static str) {
    counter!("proxy_session_pool_events_total", "event" => event).increment(1);
}

pub fn record_hook_callout(point: &'static str, outcome: &'static str) {
    counter!("proxy_hook_callouts_total", "point" => point, "outcome" => outcome).increment(1);
}

pub fn record_client_abort() {
    counter!("proxy_client_aborts_total").increment(1);
}

pub fn record_background_fill(result: &'static str) {
    counter!("proxy_background_fills_total", "result" => result).increment(1);
}

pub fn set_live_transactions(count: usize) {
    gauge!("proxy_live_transactions").set(count as f64);
}
