#![cfg(test)]
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod intermediate_proxy;
pub mod tls_origin;

pub use intermediate_proxy::IntermediateProxy;
pub use tls_origin::TlsOrigin;

use std::sync::Arc;
use std::time::Duration;

use nanohttps::adapters::rustls_engine::add_root;
use nanohttps::adapters::{CredentialProvider, HyperTunnel, RustlsEngine, TcpTransport};
use nanohttps::domain::{ConnectService, ConnectionCache, ConnectorConfig, EndpointIdentification};
use rustls::RootCertStore;

/// Client trusting only `origin`, with `names` dialing the origin directly.
pub fn service_for(
    origin: &TlsOrigin,
    names: &[&str],
    mode: Option<EndpointIdentification>,
    config: ConnectorConfig,
) -> ConnectService {
    service_trusting(origin, origin, names, mode, config)
}

/// Transport and TLS engine trusting only `trusted`, with `names` dialing `target`.
pub fn stack(
    trusted: &TlsOrigin,
    target: &TlsOrigin,
    names: &[&str],
    mode: Option<EndpointIdentification>,
    connect_timeout: Duration,
) -> (Arc<TcpTransport>, Arc<RustlsEngine>) {
    let mut transport = TcpTransport::new(connect_timeout);
    for name in names {
        transport = transport.with_override(name, target.addr());
    }

    let mut roots = RootCertStore::empty();
    add_root(&mut roots, trusted.certificate()).unwrap();
    let engine = RustlsEngine::new(roots).with_endpoint_identification(mode);
    (Arc::new(transport), Arc::new(engine))
}

/// Client trusting only `trusted`, with `names` dialing `target`.
pub fn service_trusting(
    trusted: &TlsOrigin,
    target: &TlsOrigin,
    names: &[&str],
    mode: Option<EndpointIdentification>,
    config: ConnectorConfig,
) -> ConnectService {
    let (transport, engine) = stack(trusted, target, names, mode, config.connect_timeout);

    ConnectService::new(
        transport,
        engine,
        Arc::new(HyperTunnel::new()),
        Arc::new(CredentialProvider::new(vec![]).unwrap()),
        Arc::new(ConnectionCache::default()),
        config,
    )
}
