//! Origin-side plumbing: name resolution, connecting, address health.
//!
//! # Data Flow
//! ```text
//! Destination host:port
//!     → resolver.rs (static host table, then the system resolver)
//!     → select.rs (rotate resolved addresses, skip ones marked down)
//!     → connector.rs (TCP connect with timeout)
//!     → health.rs (failures mark an address down for a retry window)
//! ```
//!
//! # Design Decisions
//! - Resolver and Connector are traits so the engine can be driven by test doubles
//! - Both are cancelled by dropping their futures

pub mod connector;
pub mod health;
pub mod resolver;
pub mod select;

pub use connector::{ConnectError, ConnectOptions, Connector, TcpConnector};
pub use health::{AddressHealth, HealthRegistry};
pub use resolver::{ResolveError, ResolveOptions, Resolver, StaticResolver, SystemResolver};
pub use select::AddressSelector;
