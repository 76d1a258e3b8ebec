use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::hostname::{matches_certificate, strip_ipv6_brackets, MatchMode};
use super::session::{SessionTracker, TlsSession};
use super::{ConnectError, Result};
use crate::ports::TlsSocket;

pub type VerifyFn = dyn Fn(&str, &TlsSession) -> bool + Send + Sync;

/// Application-level decision on a host the certificate does not name.
#[derive(Clone)]
pub enum HostnameVerifier {
    /// Rejects every name the standard rules did not already accept.
    Default,
    Custom(Arc<VerifyFn>),
}

impl HostnameVerifier {
    pub fn custom<F>(verify: F) -> Self
    where
        F: Fn(&str, &TlsSession) -> bool + Send + Sync + 'static,
    {
        HostnameVerifier::Custom(Arc::new(verify))
    }

    pub fn is_default(&self) -> bool {
        matches!(self, HostnameVerifier::Default)
    }

    pub fn verify(&self, host: &str, session: &TlsSession) -> bool {
        match self {
            HostnameVerifier::Default => false,
            HostnameVerifier::Custom(verify) => verify(host, session),
        }
    }
}

impl Default for HostnameVerifier {
    fn default() -> Self {
        HostnameVerifier::Default
    }
}

impl fmt::Debug for HostnameVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostnameVerifier::Default => write!(f, "HostnameVerifier::Default"),
            HostnameVerifier::Custom(_) => write!(f, "HostnameVerifier::Custom"),
        }
    }
}

/// Post-handshake server identity check.
pub struct SpoofGuard;

impl SpoofGuard {
    /// Decides whether `session` proves the identity of `expected_host`.
    pub fn verify(expected_host: &str, session: &TlsSession, verifier: &HostnameVerifier) -> Result<()> {
        let host = strip_ipv6_brackets(expected_host);

        match session.peer_leaf() {
            Some(leaf) => match matches_certificate(host, leaf, MatchMode::Tls) {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("certificate does not name {}", host),
                Err(e) => debug!("cannot match certificate against {}: {}", host, e),
            },
            None if session.is_anonymous() => {
                debug!(
                    "anonymous cipher suite {} negotiated with {}, skipping identity check",
                    session.cipher_suite(),
                    host
                );
                return Ok(());
            }
            None => debug!("no peer certificate presented by {}", host),
        }

        if verifier.verify(host, session) {
            debug!("hostname verifier accepted {}", host);
            return Ok(());
        }

        Err(ConnectError::IdentityMismatch {
            host: host.to_string(),
        })
    }

    /// Runs [`SpoofGuard::verify`] on the tracked session; on rejection the
    /// socket is shut down and the session invalidated before the error is
    /// returned.
    pub async fn enforce(
        expected_host: &str,
        socket: &mut dyn TlsSocket,
        tracker: &SessionTracker,
        verifier: &HostnameVerifier,
    ) -> Result<()> {
        let session = tracker.current().ok_or(ConnectError::NotConnected)?;
        match Self::verify(expected_host, &session, verifier) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("server identity check failed for {}", expected_host);
                let _ = socket.shutdown().await;
                tracker.invalidate();
                Err(err)
            }
        }
    }
}
