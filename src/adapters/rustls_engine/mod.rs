mod socket;
mod verifier;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tracing::{debug, info};

use crate::domain::{ConnectError, EndpointIdentification, Result, TlsContextId};
use crate::ports::{BoxedStream, TlsEnginePort, TlsSocket};

pub use socket::RustlsSocket;

/// Trust roots: the bundled Mozilla set plus any PEM files given.
pub fn load_roots<P: AsRef<Path>>(with_webpki_roots: bool, pem_files: &[P]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if with_webpki_roots {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    for path in pem_files {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| ConnectError::Configuration(format!("cannot open {}: {}", path.display(), e)))?;
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert
                .map_err(|e| ConnectError::Configuration(format!("invalid PEM in {}: {}", path.display(), e)))?;
            add_root(&mut roots, cert)?;
            added += 1;
        }
        info!("loaded {} trust anchors from {}", added, path.display());
    }
    Ok(roots)
}

pub fn add_root(roots: &mut RootCertStore, cert: CertificateDer<'static>) -> Result<()> {
    roots
        .add(cert)
        .map_err(|e| ConnectError::Configuration(format!("unusable trust anchor: {}", e)))
}

/// [`TlsEnginePort`] backed by rustls with the ring provider.
pub struct RustlsEngine {
    context: TlsContextId,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    preset: Option<EndpointIdentification>,
}

impl RustlsEngine {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            context: TlsContextId::new(),
            roots: Arc::new(roots),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            preset: None,
        }
    }

    /// Endpoint identification mode new sockets start with.
    pub fn with_endpoint_identification(mut self, mode: Option<EndpointIdentification>) -> Self {
        self.preset = mode;
        self
    }

    /// Names of the cipher suites this engine can negotiate, in preference order.
    pub fn supported_cipher_suites(&self) -> Vec<String> {
        self.provider.cipher_suites.iter().map(socket::suite_name).collect()
    }
}

#[async_trait]
impl TlsEnginePort for RustlsEngine {
    fn context_id(&self) -> TlsContextId {
        self.context
    }

    async fn wrap(&self, stream: BoxedStream, host: &str, port: u16) -> Result<Box<dyn TlsSocket>> {
        debug!("layering TLS over connection to {}:{}", host, port);
        Ok(Box::new(RustlsSocket::new(
            stream,
            host,
            self.preset,
            self.roots.clone(),
            self.provider.clone(),
        )))
    }
}
