//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared via Arc to the server and every new transaction
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → ProxyServer swaps its ArcSwap<ProxyConfig>
//!     → transactions started afterwards see the new snapshot
//! ```
//!
//! # Design Decisions
//! - A running transaction keeps the snapshot it started with
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, AdmissionQueueConfig, BackgroundFillConfig, CacheConfig, DnsConfig,
    HeaderConfig, HookConfig, LimitConfig, ListenerConfig, ObservabilityConfig, OriginConfig,
    ProxyConfig, RedirectConfig, RemapConfig, RemapRule, SessionConfig, SharingMatch,
    TimeoutConfig, TunnelConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
