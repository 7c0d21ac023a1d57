//! HTTP transactions.
//!
//! # Data Flow
//! ```text
//! ClientConn (keep-alive loop in http::server)
//!     → engine::run_transaction
//!     → TransactionContext (state, heads, cache/origin bookkeeping)
//!     → TransactionPolicy::decide → NextAction
//!     → engine performs it: hooks, remap, resolve, cache, origin, tunnel
//!     → teardown, registry removal, ClientConn back to the loop
//! ```
//!
//! # Design Decisions
//! - The policy decides, the engine acts; policies are swappable
//! - Hooks see a `TxnHandle`, never the engine itself
//! - One pending asynchronous operation at a time, always cancellable

pub mod context;
pub mod engine;
pub mod error;
pub mod handle;
pub mod pending;
pub mod policy;
pub mod registry;
pub mod transform;

pub use context::{CacheStatus, Milestone, ResponseSource, TransactionContext, TxnOptions, TxnState};
pub use engine::{run_transaction, ClientConn, EngineServices, TxnSnapshot};
pub use error::{OriginFailure, TxnError};
pub use handle::{CalloutState, SharedState, TxnHandle, TxnId, TxnShared};
pub use pending::{Awaited, PendingKind, PendingOp};
pub use policy::{DefaultPolicy, NextAction, TransactionPolicy};
pub use registry::{TxnRegistry, TxnSummary};
pub use transform::BodyTransform;
