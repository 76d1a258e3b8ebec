use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ProtocolVersion, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::verifier::IdentityVerifier;
use crate::domain::hostname::strip_ipv6_brackets;
use crate::domain::{Certificate, ConnectError, EndpointIdentification, Result, TlsSession};
use crate::ports::{BoxedStream, HandshakeListener, TlsSocket};

pub(super) fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn protocol_for(name: &str) -> Result<&'static SupportedProtocolVersion> {
    match name {
        "TLSv1.2" => Ok(&rustls::version::TLS12),
        "TLSv1.3" => Ok(&rustls::version::TLS13),
        other => Err(ConnectError::Configuration(format!("unsupported protocol {}", other))),
    }
}

fn protocol_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{:?}", other),
    }
}

fn session_of(conn: &ClientConnection) -> TlsSession {
    let cipher = conn
        .negotiated_cipher_suite()
        .map(|suite| suite_name(&suite))
        .unwrap_or_else(|| "SSL_NULL_WITH_NULL_NULL".to_string());
    let mut session = TlsSession::new(cipher);
    if let Some(version) = conn.protocol_version() {
        session = session.with_protocol(protocol_name(version));
    }
    if let Some(chain) = conn.peer_certificates() {
        session = session.with_peer_certificates(chain.iter().map(|der| Certificate::from_der(der.as_ref())).collect());
    }
    session
}

enum State {
    Pending(BoxedStream),
    Established(Box<TlsStream<BoxedStream>>),
    Failed,
}

/// Client side of a rustls connection. Configuration may change until
/// [`TlsSocket::start_handshake`] runs.
pub struct RustlsSocket {
    state: State,
    host: String,
    mode: Option<EndpointIdentification>,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    suites: Option<Vec<SupportedCipherSuite>>,
    versions: Option<Vec<&'static SupportedProtocolVersion>>,
    listeners: Vec<Arc<dyn HandshakeListener>>,
}

impl RustlsSocket {
    pub(super) fn new(
        stream: BoxedStream,
        host: &str,
        mode: Option<EndpointIdentification>,
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            state: State::Pending(stream),
            host: host.to_string(),
            mode,
            roots,
            provider,
            suites: None,
            versions: None,
            listeners: Vec::new(),
        }
    }

    fn client_config(&self) -> Result<ClientConfig> {
        let mut provider = (*self.provider).clone();
        if let Some(suites) = &self.suites {
            provider.cipher_suites = suites.clone();
        }
        let provider = Arc::new(provider);

        let verifier = IdentityVerifier::new(self.roots.clone(), provider.clone(), self.mode, &self.host)?;
        let versions = self.versions.as_deref().unwrap_or(rustls::DEFAULT_VERSIONS);

        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map_err(|e| ConnectError::Configuration(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(config)
    }
}

#[async_trait]
impl TlsSocket for RustlsSocket {
    fn host(&self) -> &str {
        &self.host
    }

    fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
    }

    fn endpoint_identification(&self) -> Option<EndpointIdentification> {
        self.mode
    }

    fn set_endpoint_identification(&mut self, mode: Option<EndpointIdentification>) {
        self.mode = mode;
    }

    fn set_enabled_cipher_suites(&mut self, suites: &[String]) -> Result<()> {
        let mut enabled = Vec::with_capacity(suites.len());
        for name in suites {
            let suite = self
                .provider
                .cipher_suites
                .iter()
                .find(|suite| suite_name(suite) == *name)
                .ok_or_else(|| ConnectError::Configuration(format!("unsupported cipher suite {}", name)))?;
            enabled.push(*suite);
        }
        self.suites = Some(enabled);
        Ok(())
    }

    fn set_enabled_protocols(&mut self, protocols: &[String]) -> Result<()> {
        let versions = protocols
            .iter()
            .map(|name| protocol_for(name))
            .collect::<Result<Vec<_>>>()?;
        self.versions = Some(versions);
        Ok(())
    }

    fn add_handshake_listener(&mut self, listener: Arc<dyn HandshakeListener>) {
        self.listeners.push(listener);
    }

    fn is_handshake_complete(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    async fn start_handshake(&mut self) -> Result<()> {
        let stream = match std::mem::replace(&mut self.state, State::Failed) {
            State::Pending(stream) => stream,
            other => {
                self.state = other;
                return Err(ConnectError::Handshake("handshake already attempted".to_string()));
            }
        };

        let config = self.client_config()?;
        let server_name = ServerName::try_from(strip_ipv6_brackets(&self.host).to_string())
            .map_err(|e| ConnectError::InvalidUrl(format!("{}: {}", self.host, e)))?;

        debug!("starting TLS handshake with {} (identification {:?})", self.host, self.mode);
        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        for listener in &self.listeners {
            listener.handshake_completed(session_of(tls.get_ref().1));
        }
        self.state = State::Established(Box::new(tls));
        Ok(())
    }

    fn session(&self) -> Option<TlsSession> {
        match &self.state {
            State::Established(tls) => Some(session_of(tls.get_ref().1)),
            _ => None,
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake not completed")
}

impl AsyncRead for RustlsSocket {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Established(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for RustlsSocket {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut self.state {
            State::Established(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
            _ => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Established(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
            State::Pending(stream) => Pin::new(stream).poll_flush(cx),
            State::Failed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Established(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
            State::Pending(stream) => Pin::new(stream).poll_shutdown(cx),
            State::Failed => Poll::Ready(Ok(())),
        }
    }
}
