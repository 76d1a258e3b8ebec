pub mod credentials;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use credentials::CredentialsPort;
pub use tls::{HandshakeListener, TlsEnginePort, TlsSocket};
pub use transport::{BoxedStream, Stream, TransportPort};
pub use tunnel::{TunnelPort, TunnelRequest};
