use crate::domain::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected, bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Stream>;

/// Port for opening raw transport connections
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Open a TCP connection to `host:port`
    async fn connect_tcp(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// Open a connection to `host:port` relayed by a SOCKS5 proxy
    async fn connect_via_socks(
        &self,
        proxy_host: &str,
        proxy_port: u16,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream>;
}
