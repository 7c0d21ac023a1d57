//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Ctrl-C → Shutdown::trigger
//!         → ProxyServer stops accepting
//!         → client sessions finish their current transaction
//!         → ConnectionTracker drains (bounded by listener.drain_secs)
//!         → admin API and config watcher stop
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Draining has a deadline; sessions still open afterwards are dropped

pub mod shutdown;

pub use shutdown::Shutdown;
