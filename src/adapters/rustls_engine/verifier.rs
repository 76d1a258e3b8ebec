use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::domain::hostname::{matches_certificate, MatchMode};
use crate::domain::{Certificate, ConnectError, EndpointIdentification, Result};

/// Chain validation against the trust roots, plus the host name check of the
/// configured endpoint identification mode. With no mode only the chain is
/// checked.
#[derive(Debug)]
pub(super) struct IdentityVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    mode: Option<EndpointIdentification>,
    host: String,
}

impl IdentityVerifier {
    pub(super) fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        mode: Option<EndpointIdentification>,
        host: &str,
    ) -> Result<Self> {
        let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| ConnectError::Configuration(format!("cannot build certificate verifier: {}", e)))?;
        Ok(Self {
            webpki,
            mode,
            host: host.to_string(),
        })
    }

    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        // The name is checked after the chain, so a name error means the chain is good.
        match self
            .webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
            | Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. })) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }
}

impl ServerCertVerifier for IdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.mode {
            Some(EndpointIdentification::Https) => {
                self.webpki
                    .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            Some(EndpointIdentification::Ldaps) => {
                let verified = self.verify_chain(end_entity, intermediates, server_name, ocsp_response, now)?;
                let leaf = Certificate::from_der(end_entity.as_ref());
                match matches_certificate(&self.host, &leaf, MatchMode::Ldap) {
                    Ok(true) => Ok(verified),
                    Ok(false) => Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)),
                    Err(e) => Err(rustls::Error::General(e.to_string())),
                }
            }
            None => self.verify_chain(end_entity, intermediates, server_name, ocsp_response, now),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}
