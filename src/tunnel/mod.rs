//! Producer/consumer byte tunnel.
//!
//! # Data Flow
//! ```text
//! add_producer(source vc, length, chunk action)   add_consumer(sink vc, producer, finish)
//!            │                                              │
//!            └────────────── Tunnel::run(table) ────────────┘
//!                                  │
//!                 take read/write sides out of the VcTable
//!                                  │
//!         one pump per producer (FuturesUnordered, same task)
//!             read → chunk action → write to every alive consumer
//!                                  │
//!         report: producer outcome, per-consumer outcome, leftover bytes
//!                                  │
//!         surviving sides go back to the table, closed ones free their slot
//! ```
//!
//! # Design Decisions
//! - Each chunk action is applied once per byte range; consumers get either
//!   the wire view or, for cache writers, the de-framed body
//! - A truncated body is never finished as if complete: consumers are aborted
//! - A client consumer failing with a cache writer attached may keep the
//!   producer running (background fill), decided by `BackgroundFillPolicy`
//! - Chained pairs abort each other, which is what a blind tunnel needs

pub mod chunk;
pub mod fill;
pub mod graph;
mod pump;

pub use chunk::{ChunkError, ChunkedDecoder, ChunkedEncoder};
pub use fill::{BackgroundFillPolicy, FillProgress, NeverFill, RatioFill};
pub use graph::{
    Consumer, ConsumerSummary, Producer, ProducerSummary, Tunnel, TunnelError, TunnelReport,
    TunnelSettings,
};

/// Index of a producer inside one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerId(pub(crate) usize);

/// Index of a consumer inside one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub(crate) usize);

/// How many bytes a producer moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Known(u64),
    UntilEos,
}

impl BodyLength {
    pub fn known(&self) -> Option<u64> {
        match self {
            BodyLength::Known(n) => Some(*n),
            BodyLength::UntilEos => None,
        }
    }
}

/// Transfer-coding transform applied by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAction {
    /// Identity body in, identity body out.
    PassThrough,
    /// Chunked body in, forwarded verbatim; ends at the terminating chunk.
    PassThroughChunked,
    /// Identity body in, chunked out.
    Chunk,
    /// Chunked body in, identity out.
    Dechunk,
}

/// Tri-state endpoint status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Alive,
    Success,
    Closed,
}

/// What a consumer does with its sink after a successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    /// Shut the sink down (commits cache writers, half-closes sockets).
    Close,
    /// Flush and hand the sink back for reuse (keep-alive).
    Release,
}

/// How a producer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// Declared length reached or terminating chunk read.
    Complete,
    /// Source reached EOS with no declared length.
    EndOfStream,
    /// Stopped early on request; success at the bytes moved so far.
    Precomplete,
    /// EOS before the declared length or terminating chunk.
    Truncated,
    ReadError(std::io::ErrorKind),
    Timeout,
    Aborted,
    /// Every consumer that needed the data is gone.
    ConsumersGone,
}

impl ProducerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProducerOutcome::Complete | ProducerOutcome::EndOfStream | ProducerOutcome::Precomplete
        )
    }
}

/// How a consumer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    Complete,
    WriteError(std::io::ErrorKind),
    Timeout,
    /// Its producer failed or was aborted.
    Aborted,
}

impl ConsumerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConsumerOutcome::Complete)
    }
}
