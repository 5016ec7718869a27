//! Transports that connections run over.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tabgate_core::Endpoint;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::commands::ConnectionError;

/// Buffered reader and writer halves of an open transport.
pub struct Link {
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens transports to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, ConnectionError>;
}

/// Dials `host:port` over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, ConnectionError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(endpoint.address()))
            .await
            .map_err(|_| ConnectionError::Timeout("connect"))??;

        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer))
    }
}
