use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::cache::{Checkout, ConnectionCache, PooledConnection};
use super::session::{Certificate, Principal, SessionTracker, TlsSession};
use super::upgrade::{Socket, TlsUpgrade, UpgradeConfig};
use super::{
    destination_of, ConnectError, ConnectionKey, ConnectorState, IdentityCheck, ProxyDescriptor, Result,
};
use crate::ports::{BoxedStream, CredentialsPort, TlsEnginePort, TransportPort, TunnelPort, TunnelRequest};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Client identification string sent to proxies, `<agent> nanohttps/<version>`.
pub fn user_agent(agent: Option<&str>) -> String {
    let own = format!("nanohttps/{}", crate::VERSION);
    match agent.map(str::trim).filter(|a| !a.is_empty()) {
        Some(agent) => format!("{} {}", agent, own),
        None => own,
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub user_agent: String,
    /// Proxy used when a connect call does not name one.
    pub proxy: ProxyDescriptor,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Try the destination directly, once, when the proxy refuses the tunnel.
    pub tunnel_fallback_direct: bool,
    pub upgrade: UpgradeConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            user_agent: user_agent(None),
            proxy: ProxyDescriptor::None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            tunnel_fallback_direct: false,
            upgrade: UpgradeConfig::default(),
        }
    }
}

async fn bounded<T>(limit: Duration, stage: &'static str, work: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, work).await.map_err(|_| ConnectError::Timeout(stage))?
}

/// Shared half of the client: ports, pool and configuration. Cheap to clone;
/// every request gets its own [`Connector`] from it.
#[derive(Clone)]
pub struct ConnectService {
    transport: Arc<dyn TransportPort>,
    engine: Arc<dyn TlsEnginePort>,
    tunnel: Arc<dyn TunnelPort>,
    credentials: Arc<dyn CredentialsPort>,
    cache: Arc<ConnectionCache>,
    config: Arc<ConnectorConfig>,
}

impl ConnectService {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        engine: Arc<dyn TlsEnginePort>,
        tunnel: Arc<dyn TunnelPort>,
        credentials: Arc<dyn CredentialsPort>,
        cache: Arc<ConnectionCache>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            transport,
            engine,
            tunnel,
            credentials,
            cache,
            config: Arc::new(config),
        }
    }

    pub fn connector(&self) -> Connector {
        Connector::new(self.clone())
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn key_for(&self, url: &Url, proxy_override: Option<ProxyDescriptor>) -> Result<ConnectionKey> {
        let (host, port) = destination_of(url)?;
        let proxy = proxy_override.unwrap_or_else(|| self.config.proxy.clone());
        Ok(ConnectionKey::new(
            host,
            port,
            proxy,
            self.engine.context_id(),
            self.credentials.identity(),
        ))
    }

    /// Pooled connection usable for `key`, if any. Everything else the pool
    /// hands back is closed.
    async fn take_cached(&self, key: &ConnectionKey) -> Option<PooledConnection> {
        let Checkout { connection, stale } = self.cache.get(key);
        for conn in stale {
            conn.close().await;
        }

        let conn = connection?;
        if conn.session().current().map_or(false, |s| s.is_valid()) {
            return Some(conn);
        }
        debug!("pooled connection {} to {} lost its session, closing it", conn.id(), key.authority());
        conn.close().await;
        None
    }

    /// Closes every pooled connection and forgets cached proxy credentials.
    pub async fn shutdown(&self) -> Result<()> {
        self.cache.clear().await;
        self.credentials.clear_cache().await
    }

    async fn proxy_authorization(&self, proxy_host: &str) -> Result<Option<String>> {
        let credentials = self.credentials.get_credentials(proxy_host).await?;
        Ok(credentials.map(|c| c.to_basic_auth()))
    }
}

/// Drives one connection attempt from cache lookup to an authenticated,
/// ready-to-use connection, and exposes what was negotiated.
pub struct Connector {
    service: ConnectService,
    state: ConnectorState,
    session: Option<Arc<SessionTracker>>,
    proxy: ProxyDescriptor,
}

impl Connector {
    pub fn new(service: ConnectService) -> Self {
        Self {
            service,
            state: ConnectorState::Unconnected,
            session: None,
            proxy: ProxyDescriptor::None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    fn transition(&mut self, next: ConnectorState) {
        debug!("connector {} -> {}", self.state, next);
        self.state = next;
    }

    /// Returns a connection to the destination of `url`, reusing a pooled
    /// one when its key matches exactly.
    pub async fn connect(&mut self, url: &Url, proxy_override: Option<ProxyDescriptor>) -> Result<ReadyConnection> {
        if self.state != ConnectorState::Unconnected {
            return Err(ConnectError::Configuration(format!(
                "cannot connect a connector that is {}",
                self.state
            )));
        }

        match self.establish(url, proxy_override).await {
            Ok(conn) => {
                self.session = Some(conn.inner.session().clone());
                self.proxy = conn.inner.proxy().clone();
                self.transition(ConnectorState::Ready);
                Ok(conn)
            }
            Err(err) => {
                warn!("connection to {} failed: {}", url, err);
                self.transition(ConnectorState::Failed);
                Err(err)
            }
        }
    }

    async fn establish(&mut self, url: &Url, proxy_override: Option<ProxyDescriptor>) -> Result<ReadyConnection> {
        let key = self.service.key_for(url, proxy_override)?;

        if let Some(conn) = self.service.take_cached(&key).await {
            info!("reusing connection {} for {}", conn.id(), key);
            return Ok(ReadyConnection::new(key, conn, true));
        }

        self.transition(ConnectorState::Connecting);
        let (stream, proxy_used) = self.open(&key).await?;

        self.transition(ConnectorState::TlsHandshaking);
        let config = &self.service.config;
        let upgrade_config = UpgradeConfig {
            handshake_timeout: config.upgrade.handshake_timeout.or(Some(config.read_timeout)),
            ..config.upgrade.clone()
        };
        let tracker = Arc::new(SessionTracker::new());
        let upgrade = TlsUpgrade::new(self.service.engine.clone(), self.service.transport.clone());
        let outcome = upgrade
            .upgrade(Socket::Plain(stream), &key.host, key.port, &upgrade_config, tracker.clone())
            .await?;

        let proxy_used = if outcome.direct_fallback {
            warn!("TLS over {} failed, fell back to a direct connection", proxy_used);
            ProxyDescriptor::None
        } else {
            proxy_used
        };
        let key = ConnectionKey {
            proxy: proxy_used,
            ..key
        };
        let conn = PooledConnection::new(
            outcome.socket,
            tracker,
            key.proxy.clone(),
            key.authenticator.clone(),
            outcome.identity_check,
        );
        info!("opened connection {} for {}", conn.id(), key);
        Ok(ReadyConnection::new(key, conn, false))
    }

    /// Opens the byte stream the TLS layer runs over, and reports the proxy
    /// it actually went through.
    async fn open(&mut self, key: &ConnectionKey) -> Result<(BoxedStream, ProxyDescriptor)> {
        let transport = self.service.transport.clone();
        let connect_timeout = self.service.config.connect_timeout;

        match &key.proxy {
            ProxyDescriptor::None => {
                let stream = bounded(connect_timeout, "connect", transport.connect_tcp(&key.host, key.port)).await?;
                Ok((stream, ProxyDescriptor::None))
            }
            ProxyDescriptor::Socks { host, port } => {
                let stream = bounded(
                    connect_timeout,
                    "connect",
                    transport.connect_via_socks(host, *port, &key.host, key.port),
                )
                .await?;
                Ok((stream, key.proxy.clone()))
            }
            ProxyDescriptor::HttpTunnel { host, port } => {
                let stream = bounded(connect_timeout, "connect", transport.connect_tcp(host, *port)).await?;

                self.transition(ConnectorState::Tunneling);
                let request = TunnelRequest {
                    user_agent: self.service.config.user_agent.clone(),
                    proxy_authorization: self.service.proxy_authorization(host).await?,
                };
                let tunneled = bounded(
                    self.service.config.read_timeout,
                    "proxy tunnel",
                    self.service.tunnel.establish(stream, &key.host, key.port, &request),
                )
                .await;

                match tunneled {
                    Ok(stream) => Ok((stream, key.proxy.clone())),
                    Err(err @ ConnectError::Tunnel(_)) if self.service.config.tunnel_fallback_direct => {
                        warn!("{}; trying {} directly", err, key.authority());
                        self.transition(ConnectorState::Connecting);
                        let stream =
                            bounded(connect_timeout, "connect", transport.connect_tcp(&key.host, key.port)).await?;
                        Ok((stream, ProxyDescriptor::None))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Hands the connection back to the pool for the next request to the
    /// same key. Returns false if it was closed instead.
    pub async fn release(&mut self, conn: ReadyConnection) -> bool {
        let valid = conn.session().map_or(false, |s| s.is_valid());
        if !valid {
            self.close(conn).await;
            return false;
        }
        let ReadyConnection { key, inner, .. } = conn;
        let pooled = self.service.cache.put(&key, inner);
        self.transition(if pooled {
            ConnectorState::IdleCached
        } else {
            ConnectorState::Closed
        });
        pooled
    }

    pub async fn close(&mut self, conn: ReadyConnection) {
        conn.inner.close().await;
        self.transition(ConnectorState::Closed);
    }

    fn ready_session(&self) -> Result<Arc<TlsSession>> {
        if self.state != ConnectorState::Ready {
            return Err(ConnectError::NotConnected);
        }
        self.session
            .as_ref()
            .and_then(|tracker| tracker.current())
            .ok_or(ConnectError::NotConnected)
    }

    pub fn cipher_suite(&self) -> Result<String> {
        Ok(self.ready_session()?.cipher_suite().to_string())
    }

    /// Fails with [`ConnectError::PeerUnverified`] when the server did not
    /// authenticate.
    pub fn peer_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.ready_session()?.peer_certificates()?.to_vec())
    }

    pub fn local_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.ready_session()?.local_certificates().to_vec())
    }

    pub fn peer_principal(&self) -> Result<Principal> {
        self.ready_session()?.peer_principal()
    }

    pub fn local_principal(&self) -> Result<Option<Principal>> {
        Ok(self.ready_session()?.local_principal())
    }

    /// Proxy host the connection was tunneled through, if it was.
    pub fn proxy_host(&self) -> Result<Option<String>> {
        self.ready_session()?;
        Ok(self.tunnel_endpoint().map(|(host, _)| host.to_string()))
    }

    pub fn proxy_port(&self) -> Result<Option<u16>> {
        self.ready_session()?;
        Ok(self.tunnel_endpoint().map(|(_, port)| port))
    }

    fn tunnel_endpoint(&self) -> Option<(&str, u16)> {
        if self.proxy.is_tunnel() {
            self.proxy.endpoint()
        } else {
            None
        }
    }
}

/// Authenticated connection handed to the HTTP layer.
pub struct ReadyConnection {
    key: ConnectionKey,
    inner: PooledConnection,
    reused: bool,
}

impl ReadyConnection {
    fn new(key: ConnectionKey, inner: PooledConnection, reused: bool) -> Self {
        Self { key, inner, reused }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// True when the connection came out of the pool.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn session(&self) -> Option<Arc<TlsSession>> {
        self.inner.session().current()
    }

    pub fn identity_check(&self) -> IdentityCheck {
        self.inner.identity_check()
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        self.inner.proxy()
    }
}

impl std::fmt::Debug for ReadyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyConnection")
            .field("key", &self.key)
            .field("connection", &self.inner)
            .field("reused", &self.reused)
            .finish()
    }
}

impl AsyncRead for ReadyConnection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.socket_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReadyConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(self.inner.socket_mut()).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.socket_mut()).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.socket_mut()).poll_shutdown(cx)
    }
}
