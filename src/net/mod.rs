//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (identity, lifecycle tracking)
//!     → io.rs (type-erased stream handed to the transaction engine)
//!
//! Outgoing origin connection
//!     → upstream::connector (TCP connect)
//!     → io.rs (BoxIo)
//!     → vc table slot of the owning transaction
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Every virtual connection (client, origin, cache, transform) gets a
//!   process-unique `ConnectionId`
//! - Streams are type-erased once at the edge so the engine never sees
//!   concrete socket types

pub mod connection;
pub mod io;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use io::{BoxIo, IoStream};
