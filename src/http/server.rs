//! Proxy server: accept loop and client sessions.
//!
//! # Responsibilities
//! - Accept client connections through the bounded `Listener`
//! - Run one client session per connection: transactions back to back while
//!   the connection stays keep-alive
//! - Hold the current config snapshot and swap it on reload
//! - Purge expired idle origin sessions in the background
//! - Stop accepting on shutdown and let sessions drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::lifecycle::Shutdown;
use crate::net::io::boxed;
use crate::net::listener::{Accepted, Listener, ListenerError};
use crate::net::{ConnectionGuard, ConnectionTracker};
use crate::txn::{run_transaction, ClientConn, EngineServices, TxnSnapshot};

const POOL_PURGE_INTERVAL: Duration = Duration::from_secs(5);

/// State shared by the accept loop, client sessions and the admin API.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<ArcSwap<TxnSnapshot>>,
    pub services: Arc<EngineServices>,
    pub tracker: ConnectionTracker,
    pub started: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("services", &self.services)
            .field("sessions", &self.tracker.active_count())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Snapshot for a new transaction.
    pub fn snapshot(&self) -> TxnSnapshot {
        TxnSnapshot::clone(&self.inner.load())
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        Arc::clone(&self.inner.load().config)
    }
}

pub struct ProxyServer {
    state: AppState,
}

impl ProxyServer {
    /// Server with the default engine services.
    pub fn new(config: ProxyConfig) -> Self {
        let services = EngineServices::from_config(&config);
        Self::with_services(Arc::new(config), services)
    }

    pub fn with_services(config: Arc<ProxyConfig>, services: EngineServices) -> Self {
        let state = AppState {
            inner: Arc::new(ArcSwap::from_pointee(TxnSnapshot::new(config))),
            services: Arc::new(services),
            tracker: ConnectionTracker::new(),
            started: Instant::now(),
        };
        Self { state }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Install a reloaded config. Transactions already running keep theirs.
    pub fn apply_config(&self, config: Arc<ProxyConfig>) {
        let snapshot = TxnSnapshot::new(config);
        tracing::info!(remap_rules = snapshot.remap.len(), "Config snapshot swapped");
        self.state.inner.store(Arc::new(snapshot));
    }

    /// Accept until shutdown, then wait for sessions to drain.
    pub async fn run(&self, listener: Listener, shutdown: Shutdown) -> Result<(), ListenerError> {
        let local = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %local, "Proxy server starting");

        let purge = tokio::spawn(purge_idle_sessions(self.state.clone(), shutdown.clone()));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(accepted) => {
                    let guard = self.state.tracker.track();
                    let state = self.state.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_client(state, accepted, local, guard, shutdown));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        listener.close();
        let drain = Duration::from_secs(self.state.config().listener.drain_secs);
        let active = self.state.tracker.active_count();
        tracing::info!(active_sessions = active, drain = ?drain, "Stopped accepting, draining");
        if !self.state.tracker.wait_for_drain(drain).await {
            tracing::warn!(
                remaining = self.state.tracker.active_count(),
                "Drain deadline passed with sessions still open"
            );
        }
        purge.abort();
        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// One client connection: transactions until it stops being keep-alive.
async fn serve_client(
    state: AppState,
    accepted: Accepted,
    listener_addr: SocketAddr,
    guard: ConnectionGuard,
    shutdown: Shutdown,
) {
    let Accepted { stream, peer, permit } = accepted;
    let local = stream.local_addr().unwrap_or(listener_addr);
    let span = tracing::info_span!("client", connection_id = %guard.id(), peer_addr = %peer);

    async move {
        let mut conn = ClientConn::new(guard.id(), boxed(stream), peer, local);
        loop {
            let services = Arc::clone(&state.services);
            match run_transaction(services, state.snapshot(), conn).await {
                Some(next) if !shutdown.is_triggered() => conn = next,
                Some(_) => {
                    tracing::debug!("Shutting down, closing keep-alive connection");
                    break;
                }
                None => break,
            }
        }
        tracing::debug!("Client session ended");
        drop(permit);
        drop(guard);
    }
    .instrument(span)
    .await
}

async fn purge_idle_sessions(state: AppState, shutdown: Shutdown) {
    let mut tick = tokio::time::interval(POOL_PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.triggered() => return,
            _ = tick.tick() => {
                let purged = state.services.pool.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Expired idle origin sessions closed");
                }
            }
        }
    }
}
