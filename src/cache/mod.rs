//! HTTP cache.
//!
//! # Data Flow
//! ```text
//! Engine, request mapped
//!     → cacheability.rs (may this request read or write the cache?)
//!     → pipeline.rs lookup()
//!         → store.open_read(): Hit fresh / Hit stale / Miss / Busy (writer active)
//!         → Busy is retried while read-while-writer allows, then treated as a miss
//!     → origin response: cacheability.rs decides the TTL
//!     → pipeline.rs open_writer() → CacheWriter → sink bound as a cache-write VC
//!     → the tunnel feeds the sink; shutdown commits, drop discards
//! ```
//!
//! # Design Decisions
//! - The engine only sees the `CacheStore` trait; `MemoryCache` is the shipped store
//! - One writer per key at a time
//! - Stale objects are kept for serving when the origin fails

pub mod cacheability;
pub mod memory;
pub mod pipeline;
pub mod store;

pub use memory::MemoryCache;
pub use pipeline::{CachePipeline, LookupOutcome};
pub use store::{
    CacheError, CacheHit, CacheKey, CacheReadResult, CacheStats, CacheStore, CacheWriteResult,
    CacheWriter, CachedObject,
};
