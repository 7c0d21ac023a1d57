//! The one outstanding asynchronous operation of a transaction.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::vc::ReadSide;

/// Pipelined client bytes buffered while waiting are capped here; past it
/// the client is no longer watched.
const WATCH_BUFFER_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Dns,
    CacheOpen,
    Connect,
    /// Scheduled retry (admission queue or connect backoff).
    Retry,
    OriginResponse,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Dns => "dns",
            PendingKind::CacheOpen => "cache_open",
            PendingKind::Connect => "connect",
            PendingKind::Retry => "retry",
            PendingKind::OriginResponse => "origin_response",
        }
    }
}

#[derive(Debug)]
pub enum Awaited<T> {
    Done(T),
    TimedOut,
    Cancelled,
    /// The client connection failed while we waited.
    ClientAborted,
}

/// Client read side watched during a wait.
pub struct ClientWatch<'a> {
    pub reader: &'a mut ReadSide,
    pub buffer: &'a mut BytesMut,
    /// Set once the client shut down its sending side. A half-closed
    /// client still gets its response, so it is no longer watched.
    pub half_closed: &'a mut bool,
}

/// Pending operation handle: at most one operation at a time.
#[derive(Debug, Default)]
pub struct PendingOp {
    kind: Option<PendingKind>,
    token: CancellationToken,
}

impl PendingOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new operation, cancelling the previous one.
    pub fn issue(&mut self, kind: PendingKind) -> CancellationToken {
        self.cancel();
        self.token = CancellationToken::new();
        self.kind = Some(kind);
        self.token.clone()
    }

    pub fn complete(&mut self) {
        self.kind = None;
    }

    /// Cancel the outstanding operation. Calling it with nothing pending
    /// does nothing.
    pub fn cancel(&mut self) {
        if let Some(kind) = self.kind.take() {
            tracing::trace!(pending = kind.as_str(), "Pending operation cancelled");
            self.token.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.kind.is_some()
    }

    pub fn kind(&self) -> Option<PendingKind> {
        self.kind
    }

    /// Await `fut` as the pending operation, bounded by `timeout`.
    ///
    /// With a client watch, bytes the client sends meanwhile are appended to
    /// its buffer. EOS stops the watch; a read error ends the wait as an abort.
    pub async fn wait<F>(
        &mut self,
        kind: PendingKind,
        timeout: Duration,
        fut: F,
        mut watch: Option<ClientWatch<'_>>,
    ) -> Awaited<F::Output>
    where
        F: Future,
    {
        let token = self.issue(kind);
        tokio::pin!(fut);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let watching = watch
                .as_ref()
                .is_some_and(|w| !*w.half_closed && w.buffer.len() < WATCH_BUFFER_LIMIT);
            let read = async {
                match watch.as_mut() {
                    Some(w) => w.reader.read_buf(w.buffer).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.kind = None;
                    return Awaited::Cancelled;
                }
                out = &mut fut => {
                    self.complete();
                    return Awaited::Done(out);
                }
                _ = &mut deadline => {
                    self.cancel();
                    return Awaited::TimedOut;
                }
                read = read, if watching => match read {
                    Ok(0) => {
                        tracing::debug!(pending = kind.as_str(), "Client half-closed while waiting");
                        if let Some(w) = watch.as_mut() {
                            *w.half_closed = true;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(pending = kind.as_str(), error = %e, "Client read failed while waiting");
                        self.cancel();
                        return Awaited::ClientAborted;
                    }
                    Ok(n) => tracing::trace!(bytes = n, "Buffered pipelined client bytes"),
                },
            }
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::io::boxed;
    use tokio::io::AsyncWriteExt;

    struct Failing;

    impl tokio::io::AsyncRead for Failing {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    fn client() -> (ReadSide, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64);
        let (r, _) = tokio::io::split(boxed(a));
        (ReadSide::Net(r), b)
    }

    #[test]
    fn issue_cancels_previous() {
        let mut op = PendingOp::new();
        let first = op.issue(PendingKind::Dns);
        let second = op.issue(PendingKind::Connect);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(op.kind(), Some(PendingKind::Connect));

        op.cancel();
        assert!(second.is_cancelled());
        assert!(!op.is_pending());
        // Nothing pending: no effect, no panic.
        op.cancel();
        drop(op);
    }

    #[tokio::test]
    async fn completes_with_output() {
        let mut op = PendingOp::new();
        let out = op
            .wait(PendingKind::Dns, Duration::from_secs(1), async { 7 }, None)
            .await;
        assert!(matches!(out, Awaited::Done(7)));
        assert!(!op.is_pending());
    }

    #[tokio::test]
    async fn times_out() {
        let mut op = PendingOp::new();
        let out = op
            .wait(
                PendingKind::Connect,
                Duration::from_millis(10),
                std::future::pending::<()>(),
                None,
            )
            .await;
        assert!(matches!(out, Awaited::TimedOut));
        assert!(!op.is_pending());
    }

    #[tokio::test]
    async fn client_eos_stops_watching_and_pipelined_bytes_are_kept() {
        let (mut reader, mut peer) = client();
        let mut buffer = BytesMut::new();
        let mut half_closed = false;
        let mut op = PendingOp::new();

        let writer = tokio::spawn(async move {
            peer.write_all(b"GET /next").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(peer);
        });

        let out = op
            .wait(
                PendingKind::OriginResponse,
                Duration::from_secs(5),
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    "response"
                },
                Some(ClientWatch {
                    reader: &mut reader,
                    buffer: &mut buffer,
                    half_closed: &mut half_closed,
                }),
            )
            .await;
        writer.await.unwrap();
        assert!(matches!(out, Awaited::Done("response")));
        assert!(half_closed);
        assert_eq!(&buffer[..], b"GET /next");
    }

    #[tokio::test]
    async fn client_read_error_aborts_the_wait() {
        let mut reader = ReadSide::Source(Box::new(Failing));
        let mut buffer = BytesMut::new();
        let mut half_closed = false;
        let mut op = PendingOp::new();

        let out = op
            .wait(
                PendingKind::Connect,
                Duration::from_secs(5),
                std::future::pending::<()>(),
                Some(ClientWatch {
                    reader: &mut reader,
                    buffer: &mut buffer,
                    half_closed: &mut half_closed,
                }),
            )
            .await;
        assert!(matches!(out, Awaited::ClientAborted));
        assert!(!half_closed);
        assert!(!op.is_pending());
    }
}
