use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use super::session::{SessionTracker, TlsSession};
use super::spoof_guard::{HostnameVerifier, SpoofGuard};
use super::{ConnectError, EndpointIdentification, IdentityCheck, Result};
use crate::ports::{BoxedStream, TlsEnginePort, TlsSocket, TransportPort};

/// Socket handed to the upgrade: raw, or already speaking TLS. A `Tls`
/// socket must have completed its handshake; the upgrade only re-targets it.
pub enum Socket {
    Plain(BoxedStream),
    Tls(Box<dyn TlsSocket>),
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeConfig {
    pub cipher_suites: Vec<String>,
    pub protocols: Vec<String>,
    pub verifier: HostnameVerifier,
    pub handshake_timeout: Option<Duration>,
}

/// Where spoofing defense happens for a verifier / socket mode combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityPolicy {
    /// Mode to install on the socket before the handshake, if it changes.
    pub install: Option<EndpointIdentification>,
    /// Run [`SpoofGuard`] after the handshake.
    pub guard: bool,
}

impl IdentityPolicy {
    pub fn decide(verifier: &HostnameVerifier, current: Option<EndpointIdentification>) -> Self {
        use EndpointIdentification::Https;

        match (verifier.is_default(), current) {
            (true, None) => IdentityPolicy {
                install: Some(Https),
                guard: false,
            },
            (true, Some(Https)) => IdentityPolicy {
                install: None,
                guard: false,
            },
            (true, Some(_)) => IdentityPolicy {
                install: None,
                guard: true,
            },
            // The socket already enforces HTTPS rules, so a custom verifier
            // never gets the chance to accept a mismatching name.
            (false, Some(Https)) => IdentityPolicy {
                install: None,
                guard: false,
            },
            (false, _) => IdentityPolicy {
                install: None,
                guard: true,
            },
        }
    }

    pub fn identity_check(&self) -> IdentityCheck {
        if self.guard {
            IdentityCheck::Application
        } else {
            IdentityCheck::Socket
        }
    }
}

pub struct UpgradeOutcome {
    pub socket: Box<dyn TlsSocket>,
    pub session: Arc<TlsSession>,
    pub identity_check: IdentityCheck,
    /// The given socket could not be wrapped and a direct one was used.
    pub direct_fallback: bool,
}

/// Turns a connected socket into an authenticated TLS connection.
pub struct TlsUpgrade {
    engine: Arc<dyn TlsEnginePort>,
    transport: Arc<dyn TransportPort>,
}

impl TlsUpgrade {
    pub fn new(engine: Arc<dyn TlsEnginePort>, transport: Arc<dyn TransportPort>) -> Self {
        Self { engine, transport }
    }

    pub async fn upgrade(
        &self,
        socket: Socket,
        host: &str,
        port: u16,
        config: &UpgradeConfig,
        tracker: Arc<SessionTracker>,
    ) -> Result<UpgradeOutcome> {
        let (mut socket, direct_fallback) = match socket {
            Socket::Tls(mut socket) => {
                // Layered over an existing TLS socket: only the declared host changes.
                debug!("reusing established TLS socket for {}", host);
                socket.set_host(host);
                let session = socket.session().ok_or(ConnectError::NotConnected)?;
                tracker.on_handshake_complete(session);
                return Ok(UpgradeOutcome {
                    session: tracker.current().ok_or(ConnectError::NotConnected)?,
                    socket,
                    identity_check: IdentityCheck::Socket,
                    direct_fallback: false,
                });
            }
            Socket::Plain(stream) => self.wrap(stream, host, port).await?,
        };

        if !config.cipher_suites.is_empty() {
            socket.set_enabled_cipher_suites(&config.cipher_suites)?;
        }
        if !config.protocols.is_empty() {
            socket.set_enabled_protocols(&config.protocols)?;
        }
        socket.add_handshake_listener(tracker.clone());

        let policy = IdentityPolicy::decide(&config.verifier, socket.endpoint_identification());
        if let Some(mode) = policy.install {
            socket.set_endpoint_identification(Some(mode));
        }

        match config.handshake_timeout {
            Some(limit) => timeout(limit, socket.start_handshake())
                .await
                .map_err(|_| ConnectError::Timeout("TLS handshake"))??,
            None => socket.start_handshake().await?,
        }

        if policy.guard {
            SpoofGuard::enforce(host, socket.as_mut(), &tracker, &config.verifier).await?;
        }

        let session = tracker.current().ok_or_else(|| {
            ConnectError::Handshake("handshake completed without a session".to_string())
        })?;
        info!(
            "TLS established with {}:{} using {} (identity checked by {:?})",
            host,
            port,
            session.cipher_suite(),
            policy.identity_check()
        );

        Ok(UpgradeOutcome {
            socket,
            session,
            identity_check: policy.identity_check(),
            direct_fallback,
        })
    }

    /// Wraps `stream`; a transport failure allows one retry on a fresh
    /// direct connection to `host:port`.
    async fn wrap(&self, stream: BoxedStream, host: &str, port: u16) -> Result<(Box<dyn TlsSocket>, bool)> {
        match self.engine.wrap(stream, host, port).await {
            Ok(socket) => Ok((socket, false)),
            Err(err) if err.is_transport() => {
                debug!("wrapping socket for {} failed ({}), retrying direct", host, err);
                let direct = self.transport.connect_tcp(host, port).await?;
                Ok((self.engine.wrap(direct, host, port).await?, true))
            }
            Err(err) => Err(err),
        }
    }
}
