use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::{ConnectError, Result};
use crate::ports::HandshakeListener;

/// Marker carried by the names of cipher suites that do not authenticate the server.
pub const ANONYMOUS_CIPHER_MARKER: &str = "_anon_";

/// A DER-encoded X.509 certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self { der: der.into() }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn parse(&self) -> Result<X509Certificate<'_>> {
        X509Certificate::from_der(&self.der)
            .map(|(_, cert)| cert)
            .map_err(|e| ConnectError::Handshake(format!("unparseable certificate: {}", e)))
    }

    /// Subject distinguished name, e.g. `CN=good.example, O=Example`.
    pub fn subject(&self) -> Result<Principal> {
        let cert = self.parse()?;
        Ok(Principal(cert.subject().to_string()))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Ok(subject) => write!(f, "Certificate({})", subject),
            Err(_) => write!(f, "Certificate({} bytes)", self.der.len()),
        }
    }
}

/// An authenticated identity, rendered as a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Negotiated state of one TLS connection.
#[derive(Debug)]
pub struct TlsSession {
    cipher_suite: String,
    protocol: Option<String>,
    local_certificates: Vec<Certificate>,
    peer_certificates: Option<Vec<Certificate>>,
    local_principal: Option<Principal>,
    peer_principal: Option<Principal>,
    valid: AtomicBool,
}

impl TlsSession {
    pub fn new(cipher_suite: impl Into<String>) -> Self {
        Self {
            cipher_suite: cipher_suite.into(),
            protocol: None,
            local_certificates: Vec::new(),
            peer_certificates: None,
            local_principal: None,
            peer_principal: None,
            valid: AtomicBool::new(true),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_peer_certificates(mut self, chain: Vec<Certificate>) -> Self {
        self.peer_certificates = if chain.is_empty() { None } else { Some(chain) };
        self
    }

    pub fn with_local_certificates(mut self, chain: Vec<Certificate>) -> Self {
        self.local_certificates = chain;
        self
    }

    /// Principals supplied directly by the engine; when absent they are
    /// derived from the leaf certificate subject.
    pub fn with_principals(mut self, local: Option<Principal>, peer: Option<Principal>) -> Self {
        self.local_principal = local;
        self.peer_principal = peer;
        self
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.cipher_suite.contains(ANONYMOUS_CIPHER_MARKER)
    }

    pub fn local_certificates(&self) -> &[Certificate] {
        &self.local_certificates
    }

    pub fn peer_certificates(&self) -> Result<&[Certificate]> {
        match &self.peer_certificates {
            Some(chain) => Ok(chain),
            None => Err(ConnectError::PeerUnverified),
        }
    }

    pub fn peer_leaf(&self) -> Option<&Certificate> {
        self.peer_certificates.as_ref().and_then(|chain| chain.first())
    }

    pub fn peer_principal(&self) -> Result<Principal> {
        if let Some(principal) = &self.peer_principal {
            return Ok(principal.clone());
        }
        let leaf = self.peer_leaf().ok_or(ConnectError::PeerUnverified)?;
        leaf.subject()
    }

    pub fn local_principal(&self) -> Option<Principal> {
        if let Some(principal) = &self.local_principal {
            return Some(principal.clone());
        }
        self.local_certificates.first().and_then(|leaf| leaf.subject().ok())
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// Holds the session currently negotiated on one connection.
///
/// The handshake listener side only ever swaps a pointer, so it is safe to
/// call from inside the TLS engine.
#[derive(Default)]
pub struct SessionTracker {
    current: ArcSwapOption<TlsSession>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    pub fn current(&self) -> Option<Arc<TlsSession>> {
        self.current.load_full()
    }

    pub fn on_handshake_complete(&self, session: TlsSession) {
        self.current.store(Some(Arc::new(session)));
    }

    pub fn invalidate(&self) {
        if let Some(session) = self.current.load_full() {
            session.invalidate();
        }
    }
}

impl HandshakeListener for SessionTracker {
    fn handshake_completed(&self, session: TlsSession) {
        self.on_handshake_complete(session);
    }
}

impl fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.current() {
            Some(session) => write!(f, "SessionTracker({})", session.cipher_suite()),
            None => write!(f, "SessionTracker(<none>)"),
        }
    }
}
