//! Opening origin connections.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::net::io::{boxed, BoxIo};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {addr} refused")]
    Refused { addr: SocketAddr },

    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("connect to {addr} failed: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub nodelay: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr, options: &ConnectOptions) -> Result<BoxIo, ConnectError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, options: &ConnectOptions) -> Result<BoxIo, ConnectError> {
        let stream = match tokio::time::timeout(options.timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    addr,
                    timeout: options.timeout,
                })
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused { addr })
            }
            Ok(Err(source)) => return Err(ConnectError::Io { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        if options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }
        Ok(boxed(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let mut io = TcpConnector.connect(addr, &ConnectOptions::default()).await.unwrap();
        let mut buf = [0u8; 2];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector.connect(addr, &ConnectOptions::default()).await.err().unwrap();
        assert!(matches!(err, ConnectError::Refused { .. }));
    }
}
