//! Type-erased byte streams.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the engine can read from and write to.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed bidirectional stream: TCP sockets in production, duplex pipes in tests.
pub type BoxIo = Box<dyn IoStream>;

/// Box a concrete stream.
pub fn boxed<T: IoStream>(io: T) -> BoxIo {
    Box::new(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn boxed_duplex_round_trip() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = boxed(a);
        let mut b = boxed(b);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
