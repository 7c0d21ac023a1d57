//! Request remapping.
//!
//! # Data Flow
//! ```text
//! Request head (host, path, target form)
//!     → remap.rs (rules ordered by priority, first match wins)
//!     → matcher.rs (host and path-prefix conditions)
//!     → Mapped(origin URL) | Forward(absolute target) | Miss
//! ```
//!
//! # Design Decisions
//! - Rules compiled once per config snapshot, immutable afterwards
//! - Prefix matching only, no regex
//! - Unmapped absolute-form requests are forwarded when forward proxying is allowed

pub mod matcher;
pub mod remap;

pub use remap::{RemapOutcome, RemapTable};
