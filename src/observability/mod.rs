//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events and spans (txn span per transaction, client span per session)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, pretty or JSON)
//!     → Prometheus scrape endpoint when enabled
//! ```
//!
//! # Design Decisions
//! - Transaction id flows through every span as `txn_id`
//! - Metrics are fire-and-forget; with no recorder installed they are no-ops

pub mod logging;
pub mod metrics;
