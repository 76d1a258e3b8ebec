use crate::domain::Result;
use crate::ports::BoxedStream;
use async_trait::async_trait;

/// Headers sent along with the CONNECT request
#[derive(Debug, Clone, Default)]
pub struct TunnelRequest {
    pub user_agent: String,
    pub proxy_authorization: Option<String>,
}

/// Port for establishing CONNECT tunnels through a forward proxy
#[async_trait]
pub trait TunnelPort: Send + Sync {
    /// Ask the proxy on the other end of `stream` to open an opaque pipe to
    /// `host:port`. The returned stream carries the tunneled bytes.
    async fn establish(
        &self,
        stream: BoxedStream,
        host: &str,
        port: u16,
        request: &TunnelRequest,
    ) -> Result<BoxedStream>;
}
