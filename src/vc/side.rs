//! Read and write sides of a virtual connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

use crate::net::BoxIo;

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// I/O handed to `VcTable::bind`.
pub enum VcIo {
    /// Bidirectional network stream, split into halves on bind.
    Stream(BoxIo),
    /// Read-only source (cache object body).
    Source(BoxRead),
    /// Write-only sink (cache writer).
    Sink(BoxWrite),
}

pub enum ReadSide {
    Net(ReadHalf<BoxIo>),
    Source(BoxRead),
}

pub enum WriteSide {
    Net(WriteHalf<BoxIo>),
    Sink(BoxWrite),
}

impl ReadSide {
    pub fn is_net(&self) -> bool {
        matches!(self, ReadSide::Net(_))
    }
}

impl WriteSide {
    pub fn is_net(&self) -> bool {
        matches!(self, WriteSide::Net(_))
    }
}

impl std::fmt::Debug for ReadSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadSide::Net(_) => f.write_str("ReadSide::Net"),
            ReadSide::Source(_) => f.write_str("ReadSide::Source"),
        }
    }
}

impl std::fmt::Debug for WriteSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteSide::Net(_) => f.write_str("WriteSide::Net"),
            WriteSide::Sink(_) => f.write_str("WriteSide::Sink"),
        }
    }
}

impl AsyncRead for ReadSide {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ReadSide::Net(r) => Pin::new(r).poll_read(cx, buf),
            ReadSide::Source(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WriteSide {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WriteSide::Net(w) => Pin::new(w).poll_write(cx, buf),
            WriteSide::Sink(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WriteSide::Net(w) => Pin::new(w).poll_flush(cx),
            WriteSide::Sink(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WriteSide::Net(w) => Pin::new(w).poll_shutdown(cx),
            WriteSide::Sink(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}
