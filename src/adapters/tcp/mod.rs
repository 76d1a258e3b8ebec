mod socks;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::{ConnectError, Result};
use crate::ports::{BoxedStream, TransportPort};

/// Plain TCP transport, with SOCKS5 relaying.
pub struct TcpTransport {
    connect_timeout: Duration,
    overrides: HashMap<String, SocketAddr>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            overrides: HashMap::new(),
        }
    }

    /// Dial `addr` whenever `host` is requested, whatever the port.
    pub fn with_override(mut self, host: &str, addr: SocketAddr) -> Self {
        self.overrides.insert(host.to_ascii_lowercase(), addr);
        self
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let connecting = async {
            match self.overrides.get(&host.to_ascii_lowercase()) {
                Some(addr) => {
                    debug!("dialing {} for {}:{}", addr, host, port);
                    TcpStream::connect(*addr).await
                }
                None => TcpStream::connect((host, port)).await,
            }
        };

        let stream = timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| ConnectError::Timeout("connect"))?
            .map_err(|e| ConnectError::Transport(format!("failed to connect to {}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl TransportPort for TcpTransport {
    async fn connect_tcp(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let stream = self.dial(host, port).await?;
        Ok(Box::new(stream))
    }

    async fn connect_via_socks(
        &self,
        proxy_host: &str,
        proxy_port: u16,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream> {
        let mut stream = self.dial(proxy_host, proxy_port).await?;
        socks::handshake(&mut stream, host, port).await?;
        debug!("SOCKS5 relay to {}:{} through {}:{} ready", host, port, proxy_host, proxy_port);
        Ok(Box::new(stream))
    }
}
