//! In-memory port implementations for unit tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use super::hostname::{matches_name, MatchMode};
use super::session::{Certificate, TlsSession};
use super::{AuthenticatorId, ConnectError, Credentials, EndpointIdentification, Result, TlsContextId};
use crate::ports::{
    BoxedStream, CredentialsPort, HandshakeListener, TlsEnginePort, TlsSocket, TransportPort, TunnelPort,
    TunnelRequest,
};

pub const ANONYMOUS_SUITE: &str = "TLS_DH_anon_WITH_AES_128_CBC_SHA";

fn certificate_for(name: &str) -> Certificate {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    Certificate::from_der(cert.der().to_vec())
}

/// Transport that hands out in-memory pipes and records every dial.
#[derive(Default)]
pub struct FakeTransport {
    connects: AtomicUsize,
    dialed: Mutex<Vec<String>>,
    refuse: Mutex<Vec<String>>,
    stall: bool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream() -> BoxedStream {
        let (ours, theirs) = tokio::io::duplex(1024);
        // Keep the far end open so writes succeed.
        std::mem::forget(theirs);
        Box::new(ours)
    }

    /// Never completes a dial.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    /// Refuse connections to `host`.
    pub fn refusing(self, host: &str) -> Self {
        self.refuse.lock().unwrap().push(host.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    async fn dial(&self, target: String, host: &str) -> Result<BoxedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.dialed.lock().unwrap().push(target.clone());
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.refuse.lock().unwrap().iter().any(|h| h == host) {
            return Err(ConnectError::Transport(format!("connection refused: {}", target)));
        }
        Ok(Self::stream())
    }
}

#[async_trait]
impl TransportPort for FakeTransport {
    async fn connect_tcp(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.dial(format!("{}:{}", host, port), host).await
    }

    async fn connect_via_socks(
        &self,
        proxy_host: &str,
        proxy_port: u16,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream> {
        self.dial(format!("socks5://{}:{}/{}:{}", proxy_host, proxy_port, host, port), proxy_host)
            .await
    }
}

/// TLS socket whose handshake only evaluates the name check of `HTTPS` mode.
pub struct FakeTlsSocket {
    stream: BoxedStream,
    host: String,
    certificate: Option<Certificate>,
    certificate_name: String,
    cipher_suite: String,
    mode: Option<EndpointIdentification>,
    listeners: Vec<Arc<dyn HandshakeListener>>,
    handshaken: bool,
    stall_handshake: bool,
    handshakes: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl FakeTlsSocket {
    pub fn new(host: &str, certificate_name: &str, mode: Option<EndpointIdentification>) -> Self {
        Self::over(FakeTransport::stream(), host, certificate_name, mode)
    }

    pub fn over(stream: BoxedStream, host: &str, certificate_name: &str, mode: Option<EndpointIdentification>) -> Self {
        Self {
            stream,
            host: host.to_string(),
            certificate: Some(certificate_for(certificate_name)),
            certificate_name: certificate_name.to_string(),
            cipher_suite: "TLS13_AES_128_GCM_SHA256".to_string(),
            mode,
            listeners: Vec::new(),
            handshaken: false,
            stall_handshake: false,
            handshakes: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn anonymous(stream: BoxedStream, host: &str, mode: Option<EndpointIdentification>) -> Self {
        Self {
            certificate: None,
            cipher_suite: ANONYMOUS_SUITE.to_string(),
            ..Self::over(stream, host, "unused.invalid", mode)
        }
    }

    fn build_session(&self) -> TlsSession {
        let chain = self.certificate.iter().cloned().collect();
        TlsSession::new(self.cipher_suite.clone())
            .with_protocol("TLSv1.3")
            .with_peer_certificates(chain)
    }
}

#[async_trait]
impl TlsSocket for FakeTlsSocket {
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
        match suites.first() {
            Some(suite) => {
                self.cipher_suite = suite.clone();
                Ok(())
            }
            None => Err(ConnectError::Configuration("no cipher suites".into())),
        }
    }

    fn set_enabled_protocols(&mut self, _protocols: &[String]) -> Result<()> {
        Ok(())
    }

    fn add_handshake_listener(&mut self, listener: Arc<dyn HandshakeListener>) {
        self.listeners.push(listener);
    }

    fn is_handshake_complete(&self) -> bool {
        self.handshaken
    }

    async fn start_handshake(&mut self) -> Result<()> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.stall_handshake {
            std::future::pending::<()>().await;
        }
        if self.certificate.is_some()
            && self.mode == Some(EndpointIdentification::Https)
            && !matches_name(&self.host, &self.certificate_name, MatchMode::Tls)
        {
            return Err(ConnectError::Handshake(format!(
                "No subject alternative DNS name matching {} found",
                self.host
            )));
        }
        self.handshaken = true;
        for listener in &self.listeners {
            listener.handshake_completed(self.build_session());
        }
        Ok(())
    }

    fn session(&self) -> Option<TlsSession> {
        if self.handshaken {
            Some(self.build_session())
        } else {
            None
        }
    }
}

impl AsyncRead for FakeTlsSocket {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for FakeTlsSocket {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let polled = Pin::new(&mut self.stream).poll_shutdown(cx);
        if polled.is_ready() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        polled
    }
}

/// Engine producing [`FakeTlsSocket`]s that present one fixed certificate.
pub struct FakeEngine {
    context: TlsContextId,
    certificate_name: String,
    anonymous: bool,
    preset: Option<EndpointIdentification>,
    failing_wraps: AtomicUsize,
    stall_handshakes: bool,
    wraps: AtomicUsize,
    handshakes: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn presenting(certificate_name: &str) -> Self {
        Self {
            context: TlsContextId(Uuid::nil()),
            certificate_name: certificate_name.to_string(),
            anonymous: false,
            preset: None,
            failing_wraps: AtomicUsize::new(0),
            stall_handshakes: false,
            wraps: AtomicUsize::new(0),
            handshakes: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            ..Self::presenting("unused.invalid")
        }
    }

    pub fn with_preset(mut self, mode: Option<EndpointIdentification>) -> Self {
        self.preset = mode;
        self
    }

    pub fn failing_wraps(self, count: usize) -> Self {
        self.failing_wraps.store(count, Ordering::SeqCst);
        self
    }

    /// Sockets whose handshake never completes.
    pub fn stalling_handshakes(mut self) -> Self {
        self.stall_handshakes = true;
        self
    }

    /// Sockets of this engine that were shut down.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn wraps(&self) -> usize {
        self.wraps.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TlsEnginePort for FakeEngine {
    fn context_id(&self) -> TlsContextId {
        self.context
    }

    async fn wrap(&self, stream: BoxedStream, host: &str, _port: u16) -> Result<Box<dyn TlsSocket>> {
        self.wraps.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_wraps.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_wraps.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectError::Transport("socket closed while layering TLS".into()));
        }

        let mut socket = if self.anonymous {
            FakeTlsSocket::anonymous(stream, host, self.preset)
        } else {
            FakeTlsSocket::over(stream, host, &self.certificate_name, self.preset)
        };
        socket.handshakes = self.handshakes.clone();
        socket.shutdowns = self.shutdowns.clone();
        socket.stall_handshake = self.stall_handshakes;
        Ok(Box::new(socket))
    }
}

/// Proxy that answers every CONNECT with success unless told to refuse.
#[derive(Default)]
pub struct FakeTunnel {
    refuse: bool,
    stall: bool,
    requests: Mutex<Vec<(String, TunnelRequest)>>,
}

impl FakeTunnel {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Never answers the CONNECT.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<(String, TunnelRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelPort for FakeTunnel {
    async fn establish(
        &self,
        stream: BoxedStream,
        host: &str,
        port: u16,
        request: &TunnelRequest,
    ) -> Result<BoxedStream> {
        self.requests
            .lock()
            .unwrap()
            .push((format!("{}:{}", host, port), request.clone()));
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.refuse {
            return Err(ConnectError::Tunnel(
                "Unable to tunnel through proxy. Proxy returns \"HTTP/1.1 403 Forbidden\"".into(),
            ));
        }
        Ok(stream)
    }
}

/// Credentials source with one fixed identity and optional proxy credentials.
pub struct FakeCredentials {
    identity: AuthenticatorId,
    credentials: Option<Credentials>,
}

impl FakeCredentials {
    pub fn new(identity: &str, credentials: Option<Credentials>) -> Self {
        Self {
            identity: AuthenticatorId(identity.to_string()),
            credentials,
        }
    }
}

#[async_trait]
impl CredentialsPort for FakeCredentials {
    fn identity(&self) -> AuthenticatorId {
        self.identity.clone()
    }

    async fn get_credentials(&self, _host: &str) -> Result<Option<Credentials>> {
        Ok(self.credentials.clone())
    }

    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }
}
