//! txn-proxy: HTTP/1.x caching proxy transaction engine.

pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod vc;

// Transaction machinery
pub mod cache;
pub mod hooks;
pub mod session;
pub mod tunnel;
pub mod txn;
pub mod upstream;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
pub use txn::{run_transaction, ClientConn, EngineServices, TxnSnapshot};
