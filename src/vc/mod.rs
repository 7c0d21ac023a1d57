//! Virtual connection (VC) handle table.
//!
//! # Data Flow
//! ```text
//! Transaction engine
//!     → allocate() reserves a slot
//!     → bind() attaches identity, kind and I/O (split into read/write sides)
//!     → engine reads headers through the slot (handler = ClientRequestHeader, ...)
//!     → tunnel takes sides out (in_tunnel = true) and puts survivors back
//!     → release() hands I/O back for pooling, retire() closes it
//!     → retire_all() at teardown
//! ```
//!
//! # Design Decisions
//! - Arena of fixed capacity; handles are (index, generation) so a handle to a
//!   retired slot is detected instead of reaching a reused connection
//! - The per-connection handler is a plain enum matched by the engine
//! - Entries owned by a running tunnel cannot be retired directly

pub mod side;
pub mod table;

pub use side::{BoxRead, BoxWrite, ReadSide, VcIo, WriteSide};
pub use table::{VcEntry, VcTable, VcTableError};

use std::sync::atomic::{AtomicU64, Ordering};

/// Role a virtual connection plays in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VcKind {
    Client,
    Origin,
    Transform,
    CacheRead,
    CacheWrite,
    RawServer,
}

impl VcKind {
    pub const ALL: [VcKind; 6] = [
        VcKind::Client,
        VcKind::Origin,
        VcKind::Transform,
        VcKind::CacheRead,
        VcKind::CacheWrite,
        VcKind::RawServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VcKind::Client => "client",
            VcKind::Origin => "origin",
            VcKind::Transform => "transform",
            VcKind::CacheRead => "cache_read",
            VcKind::CacheWrite => "cache_write",
            VcKind::RawServer => "raw_server",
        }
    }
}

impl std::fmt::Display for VcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation-checked reference to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcHandle {
    index: u16,
    generation: u32,
}

impl VcHandle {
    pub(crate) fn new(index: u16, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for VcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vc-{}.{}", self.index, self.generation)
    }
}

static IO_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of one binding of I/O to a slot. I/O events carry it so the
/// engine can route them back to the slot, or drop them if the slot moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoId(u64);

impl IoId {
    pub fn next() -> Self {
        Self(IO_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for IoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "io-{}", self.0)
    }
}

/// Current event handler of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcHandler {
    /// Bound but nobody is waiting on it.
    Idle,
    /// Engine is reading the client request header.
    ClientRequestHeader,
    /// Engine watches the client for EOS while waiting on something else.
    ClientAbortWatch,
    /// Engine is reading the origin response header.
    OriginResponseHeader,
    /// Tunnel owns the I/O.
    Tunnel,
}
