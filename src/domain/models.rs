use std::fmt;
use std::str::FromStr;

use url::Url;

use super::{ConnectError, Result};

pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// How the connection reaches its destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyDescriptor {
    None,
    Socks { host: String, port: u16 },
    HttpTunnel { host: String, port: u16 },
}

impl ProxyDescriptor {
    /// Parses `direct://`, `http://host:port` or `socks5://host:port`.
    pub fn from_url(url: &Url) -> Result<Self> {
        let endpoint = |default_port: u16| -> Result<(String, u16)> {
            let host = url
                .host_str()
                .ok_or_else(|| ConnectError::Configuration(format!("proxy URL {} has no host", url)))?;
            Ok((host.to_string(), url.port().unwrap_or(default_port)))
        };
        match url.scheme() {
            "direct" => Ok(ProxyDescriptor::None),
            "http" => {
                let (host, port) = endpoint(80)?;
                Ok(ProxyDescriptor::HttpTunnel { host, port })
            }
            "socks" | "socks5" => {
                let (host, port) = endpoint(1080)?;
                Ok(ProxyDescriptor::Socks { host, port })
            }
            other => Err(ConnectError::Configuration(format!(
                "unsupported proxy scheme {}",
                other
            ))),
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            ProxyDescriptor::None => "direct",
            ProxyDescriptor::Socks { .. } => "socks5",
            ProxyDescriptor::HttpTunnel { .. } => "http",
        }
    }

    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match self {
            ProxyDescriptor::None => None,
            ProxyDescriptor::Socks { host, port } | ProxyDescriptor::HttpTunnel { host, port } => {
                Some((host.as_str(), *port))
            }
        }
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self, ProxyDescriptor::HttpTunnel { .. })
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyDescriptor::None)
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            None => write!(f, "direct"),
            Some((host, port)) => write!(f, "{}://{}:{}", self.scheme(), host, port),
        }
    }
}

impl FromStr for ProxyDescriptor {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self> {
        let url: Url = s
            .parse()
            .map_err(|e| ConnectError::Configuration(format!("invalid proxy URL {}: {}", s, e)))?;
        ProxyDescriptor::from_url(&url)
    }
}

/// Identity of the TLS configuration that produced a connection. Two engines
/// with different trust or protocol settings never share pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsContextId(pub uuid::Uuid);

impl TlsContextId {
    pub fn new() -> Self {
        TlsContextId(uuid::Uuid::new_v4())
    }
}

impl Default for TlsContextId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the credentials source used for proxy authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatorId(pub String);

impl AuthenticatorId {
    pub fn anonymous() -> Self {
        AuthenticatorId("anonymous".to_string())
    }
}

impl fmt::Display for AuthenticatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The part of a [`ConnectionKey`] the pool buckets on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub host: String,
    pub port: u16,
    pub tls_context: TlsContextId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub proxy: ProxyDescriptor,
    pub tls_context: TlsContextId,
    pub authenticator: AuthenticatorId,
}

impl ConnectionKey {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        proxy: ProxyDescriptor,
        tls_context: TlsContextId,
        authenticator: AuthenticatorId,
    ) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            proxy,
            tls_context,
            authenticator,
        }
    }

    pub fn destination(&self) -> DestinationKey {
        DestinationKey {
            host: self.host.clone(),
            port: self.port,
            tls_context: self.tls_context,
        }
    }

    /// `host:port` as used on a CONNECT request line.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} ({})", self.authority(), self.proxy, self.authenticator)
    }
}

/// Extracts host and port from an `https` URL.
pub fn destination_of(url: &Url) -> Result<(String, u16)> {
    if url.scheme() != "https" {
        return Err(ConnectError::InvalidUrl(format!(
            "unsupported scheme {} in {}",
            url.scheme(),
            url
        )));
    }
    let host = match url.host() {
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(ConnectError::InvalidUrl(format!("missing host in {}", url))),
    };
    Ok((host, url.port().unwrap_or(DEFAULT_HTTPS_PORT)))
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub fn to_basic_auth(&self) -> String {
        use base64::Engine;
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", base64::prelude::BASE64_STANDARD.encode(credentials))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuthRule {
    pub remote_pattern: String,
    pub username: String,
    pub password_command: String,
}

/// Socket-layer hostname check mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointIdentification {
    Https,
    Ldaps,
}

impl FromStr for EndpointIdentification {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HTTPS" => Ok(EndpointIdentification::Https),
            "LDAPS" => Ok(EndpointIdentification::Ldaps),
            other => Err(ConnectError::Configuration(format!(
                "unknown endpoint identification algorithm {}",
                other
            ))),
        }
    }
}

impl fmt::Display for EndpointIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointIdentification::Https => write!(f, "HTTPS"),
            EndpointIdentification::Ldaps => write!(f, "LDAPS"),
        }
    }
}

/// Where the server identity of a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityCheck {
    Socket,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Unconnected,
    Connecting,
    Tunneling,
    TlsHandshaking,
    Ready,
    IdleCached,
    Closed,
    Failed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorState::Unconnected => "unconnected",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Tunneling => "tunneling",
            ConnectorState::TlsHandshaking => "tls-handshaking",
            ConnectorState::Ready => "ready",
            ConnectorState::IdleCached => "idle-cached",
            ConnectorState::Closed => "closed",
            ConnectorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_descriptor_from_url() {
        let proxy: ProxyDescriptor = "http://proxy.example.net:3128".parse().unwrap();
        assert_eq!(
            proxy,
            ProxyDescriptor::HttpTunnel {
                host: "proxy.example.net".into(),
                port: 3128
            }
        );
        assert!(proxy.is_tunnel());

        let socks: ProxyDescriptor = "socks5://127.0.0.1".parse().unwrap();
        assert_eq!(socks.endpoint(), Some(("127.0.0.1", 1080)));

        let direct: ProxyDescriptor = "direct://".parse().unwrap();
        assert!(direct.is_direct());

        assert!("ftp://proxy:21".parse::<ProxyDescriptor>().is_err());
    }

    #[test]
    fn test_keys_differ_on_proxy_and_authenticator() {
        let ctx = TlsContextId::new();
        let base = ConnectionKey::new("Good.Example", 443, ProxyDescriptor::None, ctx, AuthenticatorId::anonymous());
        let proxied = ConnectionKey::new(
            "good.example",
            443,
            ProxyDescriptor::HttpTunnel {
                host: "proxy".into(),
                port: 8080,
            },
            ctx,
            AuthenticatorId::anonymous(),
        );
        let other_auth = ConnectionKey::new("good.example", 443, ProxyDescriptor::None, ctx, AuthenticatorId("alice".into()));

        assert_eq!(base.host, "good.example");
        assert_ne!(base, proxied);
        assert_ne!(base, other_auth);
        assert_eq!(base.destination(), proxied.destination());
    }

    #[test]
    fn test_destination_of_https_url() {
        let url: Url = "https://good.example/index.html".parse().unwrap();
        assert_eq!(destination_of(&url).unwrap(), ("good.example".to_string(), 443));

        let url: Url = "https://[::1]:8443/".parse().unwrap();
        assert_eq!(destination_of(&url).unwrap(), ("::1".to_string(), 8443));

        let url: Url = "http://good.example/".parse().unwrap();
        assert!(matches!(destination_of(&url), Err(ConnectError::InvalidUrl(_))));
    }

    #[test]
    fn test_basic_auth() {
        let creds = Credentials::new("user".into(), "pass".into());
        assert_eq!(creds.to_basic_auth(), "Basic dXNlcjpwYXNz");
    }
}
