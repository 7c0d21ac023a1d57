//! Round-robin ordering of resolved addresses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::upstream::health::HealthRegistry;

/// Rotates the starting address between calls and drops addresses that are
/// currently marked down.
#[derive(Debug, Default)]
pub struct AddressSelector {
    counter: AtomicUsize,
}

impl AddressSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect order for one transaction. Empty when every address is down.
    pub fn order(&self, addrs: &[SocketAddr], health: &HealthRegistry) -> Vec<SocketAddr> {
        if addrs.is_empty() {
            return Vec::new();
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = addrs.len();
        (0..len)
            .map(|i| addrs[(start + i) % len])
            .filter(|addr| !health.is_down(addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rotates_and_skips_down() {
        let a: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let health = HealthRegistry::new(1, Duration::from_secs(60));
        let selector = AddressSelector::new();

        assert_eq!(selector.order(&[a, b], &health), vec![a, b]);
        assert_eq!(selector.order(&[a, b], &health), vec![b, a]);

        health.mark_failure(a);
        assert_eq!(selector.order(&[a, b], &health), vec![b]);
        health.mark_failure(b);
        assert!(selector.order(&[a, b], &health).is_empty());
    }
}
