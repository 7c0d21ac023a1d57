use axum::{extract::State, Json};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::http::server::AppState;
use crate::session::PoolStats;
use crate::txn::TxnSummary;
use crate::upstream::AddressHealth;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub client_sessions: u64,
    pub live_transactions: usize,
    pub remap_rules: usize,
}

#[derive(Serialize)]
pub struct CacheView {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub stats: CacheStats,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let snapshot = state.inner.load();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        client_sessions: state.tracker.active_count(),
        live_transactions: state.services.registry.len(),
        remap_rules: snapshot.remap.len(),
    })
}

pub async fn get_transactions(State(state): State<AppState>) -> Json<Vec<TxnSummary>> {
    Json(state.services.registry.snapshot())
}

pub async fn get_sessions(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.services.pool.stats())
}

pub async fn get_upstreams(State(state): State<AppState>) -> Json<Vec<AddressHealth>> {
    Json(state.services.health.snapshot())
}

pub async fn get_cache(State(state): State<AppState>) -> Json<CacheView> {
    let cache = &state.services.cache;
    Json(CacheView {
        enabled: cache.enabled(),
        default_ttl_secs: cache.default_ttl().as_secs(),
        stats: cache.stats(),
    })
}
