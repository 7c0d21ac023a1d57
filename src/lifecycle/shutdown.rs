//! Shutdown coordination for the proxy.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Coordinator for graceful shutdown.
///
/// Every long-running task subscribes; a trigger reaches all of them,
/// including those that subscribe after it fired.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    fired: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        let (fired, _) = watch::channel(false);
        Self {
            tx,
            fired: Arc::new(fired),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.fired.send_replace(true);
        let _ = self.tx.send(());
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.fired.borrow()
    }

    /// Resolve once shutdown has been triggered, even if that happened earlier.
    pub async fn triggered(&self) {
        let mut rx = self.fired.subscribe();
        // Err only when the sender is gone, which cannot happen while `self` lives.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Number of tasks still subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
