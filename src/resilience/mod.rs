//! Origin connect retries.
//!
//! # Data Flow
//! ```text
//! connect attempt fails
//!     → HealthRegistry::mark_failure (address may go down)
//!     → RetrySchedule::delay(attempt) (exponential backoff, jittered)
//!     → next address in selector order
//! ```
//!
//! # Design Decisions
//! - Jitter only shortens a delay, so the configured cap is a hard ceiling
//! - Timeouts live with the phase that waits (see `txn::pending`)

pub mod backoff;

pub use backoff::{calculate_backoff, RetrySchedule};
