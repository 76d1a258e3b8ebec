pub mod credentials;
pub mod hyper_client;
pub mod rustls_engine;
pub mod tcp;

pub use credentials::CredentialProvider;
pub use hyper_client::HyperTunnel;
pub use rustls_engine::{load_roots, RustlsEngine};
pub use tcp::TcpTransport;
