//! Origin session pool.
//!
//! # Data Flow
//! ```text
//! Engine, destination known
//!     → sharing.rs (is this transaction allowed to share sessions?)
//!     → pool.rs acquire()
//!         → Found(idle session)           reuse it
//!         → NotFound(ConnectPermit)       connect, then permit.into_session()
//!         → Busy                          admission queue or 503
//!     → after the response: release() back to idle, or close()
//! ```
//!
//! # Design Decisions
//! - Connection ceilings are counted by RAII slots, so a session that is
//!   dropped anywhere gives its slot back exactly once
//! - Release and close both take the session by value; it cannot be both
//! - Idle sessions are matched by address, host, or both, per config

pub mod pool;
pub mod sharing;

pub use pool::{
    Acquire, ConnectPermit, PoolError, PoolKey, PoolStats, PooledSession, QueueTicket,
    SessionId, SessionMeta, SessionPool,
};
pub use sharing::SessionPolicy;
