//! Response body transforms.
//!
//! A transform connection is a duplex pipe: the origin producer writes into
//! one end through the transform, and a second producer reads the rewritten
//! body from the other end for the client.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Rewrites a body one buffer at a time.
pub trait BodyTransform: Send {
    fn transform(&mut self, input: Bytes) -> Bytes;

    /// Bytes emitted after the last input.
    fn finish(&mut self) -> Bytes {
        Bytes::new()
    }
}

/// Writer that runs every buffer through a transform.
pub(crate) struct TransformSink<W> {
    inner: W,
    transform: Box<dyn BodyTransform>,
    pending: Bytes,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> TransformSink<W> {
    pub fn new(inner: W, transform: Box<dyn BodyTransform>) -> Self {
        Self {
            inner,
            transform,
            pending: Bytes::new(),
            finished: false,
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TransformSink<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.pending = this.transform.transform(Bytes::copy_from_slice(buf));
        // Input is accepted; output left over goes out on the next call.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finished {
            ready!(this.poll_drain(cx))?;
            this.pending = this.transform.finish();
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Both ends of a transform connection in one stream: writes go into the
/// transform, reads return its output.
pub(crate) struct TransformVc {
    sink: TransformSink<DuplexStream>,
    source: DuplexStream,
}

impl TransformVc {
    pub fn new(transform: Box<dyn BodyTransform>, buffer: usize) -> Self {
        let (input, output) = tokio::io::duplex(buffer.max(1));
        Self {
            sink: TransformSink::new(input, transform),
            source: output,
        }
    }
}

impl AsyncRead for TransformVc {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().source).poll_read(cx, buf)
    }
}

impl AsyncWrite for TransformVc {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().sink).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().sink).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().sink).poll_shutdown(cx)
    }
}
