//! Pluggable transports
//!
//! The connection dials through a [`Transport`] so the byte stream can come
//! from a TCP socket (RTMP), an SRT socket supplied by the caller, or an
//! in-memory pipe in tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;

use crate::error::{ConnectionError, Result};
use crate::protocol::constants::DEFAULT_PORT;

/// A bidirectional byte stream
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite + 'static>;

/// Opens byte streams for a URL
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, url: &Url) -> Result<BoxedStream>;
}

/// Plain TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
    timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            nodelay: true,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TcpTransport {
    pub fn new(nodelay: bool, timeout: Duration) -> Self {
        Self { nodelay, timeout }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, url: &Url) -> Result<BoxedStream> {
        let host = url.host_str().ok_or(ConnectionError::MissingHost)?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let socket = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        if self.nodelay {
            socket.set_nodelay(true)?;
        }
        tracing::debug!(host, port, "TCP connected");
        Ok(Box::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let url = Url::parse(&format!("rtmp://127.0.0.1:{port}/live")).unwrap();
        let mut stream = TcpTransport::default().dial(&url).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("rtmp://127.0.0.1:{port}/live")).unwrap();
        let err = TcpTransport::default().dial(&url).await.err().unwrap();
        assert!(err.is_transport());
    }
}
