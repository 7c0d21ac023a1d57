//! txn-proxy
//!
//! HTTP/1.x caching proxy built on a per-transaction state machine.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────────┐
//!                       │                      TXN-PROXY                       │
//!                       │                                                      │
//!   Client connection   │  ┌──────────┐   ┌──────────────┐   ┌─────────────┐   │
//!   ────────────────────┼─▶│   net    │──▶│ http::server │──▶│ txn engine  │   │
//!                       │  │ listener │   │ client loop  │   │ + policy    │   │
//!                       │  └──────────┘   └──────────────┘   └──────┬──────┘   │
//!                       │                                           │          │
//!                       │        ┌──────────┬──────────┬────────────┤          │
//!                       │        ▼          ▼          ▼            ▼          │
//!                       │  ┌─────────┐ ┌────────┐ ┌─────────┐ ┌───────────┐    │
//!                       │  │  hooks  │ │ cache  │ │ session │ │  tunnel   │    │
//!                       │  │         │ │        │ │  pool   │ │ over VCs  │────┼──▶ Origin
//!                       │  └─────────┘ └────────┘ └─────────┘ └───────────┘    │
//!                       │                                                      │
//!                       │  config + watcher · observability · admin API        │
//!                       └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use txn_proxy::admin::setup_admin_router;
use txn_proxy::config::{load_config, ConfigWatcher, ProxyConfig};
use txn_proxy::http::ProxyServer;
use txn_proxy::lifecycle::Shutdown;
use txn_proxy::net::listener::Listener;
use txn_proxy::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "txn-proxy", version, about = "HTTP/1.x caching proxy")]
struct Args {
    /// TOML configuration file; watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.listener.bind_address = bind.clone();
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "txn-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        remap_rules = config.remap.rules.len(),
        cache_enabled = config.cache.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                metrics::init_metrics(addr);
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Shutdown::new();
    let server = Arc::new(ProxyServer::new(config.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            shutdown.trigger();
        });
    }

    // Kept alive for the process lifetime; dropping it stops the watch.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        update = updates.recv() => match update {
                            Some(config) => server.apply_config(config),
                            None => break,
                        },
                    }
                }
            });
            match watcher.run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher not started, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        let router = setup_admin_router(server.state());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, router)
                .with_graceful_shutdown(async move { shutdown.triggered().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
    }

    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
