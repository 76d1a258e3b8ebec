use std::sync::Arc;

use crate::domain::{EndpointIdentification, Result, TlsContextId, TlsSession};
use crate::ports::BoxedStream;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Observer notified once a handshake (or renegotiation) completes.
///
/// Implementations run inside the engine and must not block, perform I/O or
/// touch the connection cache.
pub trait HandshakeListener: Send + Sync {
    fn handshake_completed(&self, session: TlsSession);
}

/// A TLS socket layered over a transport stream, before or after its handshake
#[async_trait]
pub trait TlsSocket: AsyncRead + AsyncWrite + Send + Unpin {
    /// Host name the socket declares (SNI) and checks against
    fn host(&self) -> &str;

    fn set_host(&mut self, host: &str);

    fn endpoint_identification(&self) -> Option<EndpointIdentification>;

    fn set_endpoint_identification(&mut self, mode: Option<EndpointIdentification>);

    /// Restrict negotiation to the named suites, in preference order
    fn set_enabled_cipher_suites(&mut self, suites: &[String]) -> Result<()>;

    /// Restrict negotiation to the named protocol versions
    fn set_enabled_protocols(&mut self, protocols: &[String]) -> Result<()>;

    fn add_handshake_listener(&mut self, listener: Arc<dyn HandshakeListener>);

    fn is_handshake_complete(&self) -> bool;

    /// Run the handshake once; no retry.
    async fn start_handshake(&mut self) -> Result<()>;

    /// Session negotiated by the last completed handshake
    fn session(&self) -> Option<TlsSession>;
}

/// Port to the TLS library
#[async_trait]
pub trait TlsEnginePort: Send + Sync {
    /// Identity of the configuration sockets from this engine are built with
    fn context_id(&self) -> TlsContextId;

    /// Layer a not-yet-handshaken TLS socket over `stream`
    ///
    /// A `Transport` error means `stream` is unusable; the upgrade then
    /// retries once over a fresh direct connection.
    async fn wrap(&self, stream: BoxedStream, host: &str, port: u16) -> Result<Box<dyn TlsSocket>>;
}
