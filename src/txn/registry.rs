//! Live transactions, for the admin API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::txn::context::TxnState;
use crate::txn::handle::TxnId;

#[derive(Debug, Clone, Serialize)]
pub struct TxnSummary {
    pub id: TxnId,
    pub client: SocketAddr,
    pub method: String,
    pub target: String,
    pub state: &'static str,
    pub redirects: u32,
    pub age_ms: u64,
    #[serde(skip)]
    started: Instant,
}

impl TxnSummary {
    pub fn new(id: TxnId, client: SocketAddr, method: &str, target: &str) -> Self {
        Self {
            id,
            client,
            method: method.to_string(),
            target: target.to_string(),
            state: TxnState::ReadingClientHeaders.as_str(),
            redirects: 0,
            age_ms: 0,
            started: Instant::now(),
        }
    }
}

/// Read-mostly map of live transactions, written only at lifecycle points.
#[derive(Debug, Clone, Default)]
pub struct TxnRegistry {
    live: Arc<DashMap<TxnId, TxnSummary>>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, summary: TxnSummary) {
        self.live.insert(summary.id, summary);
    }

    pub fn update(&self, id: TxnId, state: TxnState, redirects: u32) {
        if let Some(mut entry) = self.live.get_mut(&id) {
            entry.state = state.as_str();
            entry.redirects = redirects;
        }
    }

    pub fn remove(&self, id: TxnId) -> Option<TxnSummary> {
        self.live.remove(&id).map(|(_, summary)| summary)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<TxnSummary> {
        let mut all: Vec<TxnSummary> = self
            .live
            .iter()
            .map(|entry| {
                let mut summary = entry.value().clone();
                summary.age_ms = summary.started.elapsed().as_millis() as u64;
                summary
            })
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_lifecycle() {
        let registry = TxnRegistry::new();
        let client: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let a = TxnId::next();
        let b = TxnId::next();
        registry.insert(TxnSummary::new(b, client, "GET", "/b"));
        registry.insert(TxnSummary::new(a, client, "GET", "/a"));
        registry.update(a, TxnState::ConnectingOrigin, 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, a);
        assert_eq!(snapshot[0].state, "connecting_origin");
        assert_eq!(snapshot[0].redirects, 1);

        let json = serde_json::to_value(&snapshot[1]).unwrap();
        assert_eq!(json["target"], "/b");
        assert!(json.get("started").is_none());

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.len(), 1);
    }
}
