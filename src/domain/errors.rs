use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    InvalidUrl(String),
    Transport(String),
    Tunnel(String),
    Handshake(String),
    IdentityMismatch { host: String },
    Configuration(String),
    PeerUnverified,
    NotConnected,
    Timeout(&'static str),
}

impl ConnectError {
    /// Transport failures are the only ones eligible for the single
    /// direct-socket fallback in the TLS upgrade.
    pub fn is_transport(&self) -> bool {
        matches!(self, ConnectError::Transport(_))
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),
            ConnectError::Transport(msg) => write!(f, "Transport failure: {}", msg),
            ConnectError::Tunnel(msg) => write!(f, "Tunnel failed: {}", msg),
            ConnectError::Handshake(msg) => write!(f, "TLS handshake failed: {}", msg),
            ConnectError::IdentityMismatch { host } => {
                write!(f, "No subject alternative name matching {} found", host)
            }
            ConnectError::Configuration(msg) => write!(f, "Invalid configuration: {}", msg),
            ConnectError::PeerUnverified => write!(f, "Peer not authenticated"),
            ConnectError::NotConnected => write!(f, "Connection is not established"),
            ConnectError::Timeout(stage) => write!(f, "Operation timed out during {}", stage),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        ConnectError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConnectError>;
