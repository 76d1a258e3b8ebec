pub mod cache;
pub mod errors;
pub mod hostname;
pub mod models;
pub mod service;
pub mod session;
pub mod spoof_guard;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Checkout, ConnectionCache, PooledConnection};
pub use errors::*;
pub use models::*;
pub use service::{ConnectService, Connector, ConnectorConfig, ReadyConnection};
pub use session::{Certificate, Principal, SessionTracker, TlsSession};
pub use spoof_guard::{HostnameVerifier, SpoofGuard};
pub use upgrade::{TlsUpgrade, UpgradeConfig};
