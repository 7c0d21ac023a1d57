//! Passive health of origin addresses.
//!
//! Connect failures count against an address; after `down_threshold`
//! consecutive failures it is marked down for `down_secs`. A success resets
//! the count. Once the window passes the address is tried again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::OriginConfig;

#[derive(Debug, Clone, Default)]
struct Entry {
    consecutive_failures: u32,
    down_until: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
}

/// Admin view of one address.
#[derive(Debug, Clone, Serialize)]
pub struct AddressHealth {
    pub address: String,
    pub down: bool,
    pub consecutive_failures: u32,
    pub down_for_secs: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    entries: Arc<DashMap<SocketAddr, Entry>>,
    threshold: u32,
    window: Duration,
}

impl HealthRegistry {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            threshold: threshold.max(1),
            window,
        }
    }

    pub fn from_config(config: &OriginConfig) -> Self {
        Self::new(config.down_threshold, Duration::from_secs(config.down_secs))
    }

    pub fn is_down(&self, addr: &SocketAddr) -> bool {
        self.entries
            .get(addr)
            .and_then(|e| e.down_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Returns true when this failure marked the address down.
    pub fn mark_failure(&self, addr: SocketAddr) -> bool {
        let mut entry = self.entries.entry(addr).or_default();
        entry.total_failures += 1;
        if entry.down_until.is_some_and(|until| Instant::now() < until) {
            return false;
        }
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold {
            entry.down_until = Some(Instant::now() + self.window);
            entry.consecutive_failures = 0;
            tracing::warn!(%addr, window_secs = self.window.as_secs(), "Origin address marked down");
            return true;
        }
        false
    }

    pub fn mark_success(&self, addr: SocketAddr) {
        let mut entry = self.entries.entry(addr).or_default();
        entry.total_successes += 1;
        entry.consecutive_failures = 0;
        if entry.down_until.take().is_some() {
            tracing::info!(%addr, "Origin address back up");
        }
    }

    pub fn snapshot(&self) -> Vec<AddressHealth> {
        let now = Instant::now();
        let mut out: Vec<AddressHealth> = self
            .entries
            .iter()
            .map(|e| {
                let remaining = e
                    .down_until
                    .and_then(|until| until.checked_duration_since(now))
                    .unwrap_or_default();
                AddressHealth {
                    address: e.key().to_string(),
                    down: !remaining.is_zero(),
                    consecutive_failures: e.consecutive_failures,
                    down_for_secs: remaining.as_secs(),
                    total_failures: e.total_failures,
                    total_successes: e.total_successes,
                }
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn threshold_marks_down_and_success_clears() {
        let health = HealthRegistry::new(2, Duration::from_secs(30));
        assert!(!health.mark_failure(addr()));
        assert!(!health.is_down(&addr()));
        assert!(health.mark_failure(addr()));
        assert!(health.is_down(&addr()));

        health.mark_success(addr());
        assert!(!health.is_down(&addr()));
        let snap = health.snapshot();
        assert_eq!(snap[0].total_failures, 2);
        assert_eq!(snap[0].total_successes, 1);
    }

    #[test]
    fn window_expires() {
        let health = HealthRegistry::new(1, Duration::from_millis(0));
        health.mark_failure(addr());
        assert!(!health.is_down(&addr()));
    }
}
