use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::cache::{DEFAULT_KEEP_ALIVE, DEFAULT_MAX_CONNECTIONS};
use crate::domain::service::{user_agent, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::domain::{
    AuthRule, ConnectError, ConnectorConfig, EndpointIdentification, ProxyDescriptor, Result, UpgradeConfig,
};

const APP_NAME: &str = "nanohttps";
const CONFIG_NAME: &str = "default-config";
const DEFAULT_PROXY_PORT: u16 = 443;

#[derive(Parser, Debug)]
#[clap(version = env!("NANOHTTPS_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
pub struct Opts {
    /// https URL to connect to
    pub url: Url,

    /// Number of sequential connections to open through the shared pool
    #[clap(long, short = 'n', default_value_t = 2)]
    pub count: usize,

    /// Comma-separated cipher suites to enable, in preference order
    #[clap(long, env = "HTTPS_CIPHER_SUITES")]
    pub cipher_suites: Option<String>,

    /// Comma-separated protocol versions to enable (TLSv1.2, TLSv1.3)
    #[clap(long, env = "HTTPS_PROTOCOLS")]
    pub protocols: Option<String>,

    /// Tunnel through this HTTP proxy
    #[clap(long, env = "HTTPS_PROXY_HOST")]
    pub proxy_host: Option<String>,

    #[clap(long, env = "HTTPS_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// Prepended to the client identification sent to proxies
    #[clap(long, env = "HTTP_AGENT")]
    pub agent: Option<String>,

    #[clap(long)]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long)]
    pub read_timeout_ms: Option<u64>,

    /// Extra trust anchors (PEM), may be repeated
    #[clap(long = "ca-file")]
    pub ca_files: Vec<PathBuf>,

    /// Host name check run by the TLS layer itself (HTTPS or LDAPS)
    #[clap(long)]
    pub endpoint_identification: Option<String>,

    /// Dial ADDR instead of resolving HOST, as HOST=ADDR
    #[clap(long)]
    pub resolve: Vec<String>,

    /// Configuration file, instead of the per-user default
    #[clap(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// On-disk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cipher_suites: Option<String>,
    pub protocols: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: u16,
    pub agent: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub max_connections: usize,
    pub ca_files: Vec<PathBuf>,
    pub endpoint_identification: Option<String>,
    pub tunnel_fallback_direct: bool,
    pub auth_rules: Vec<AuthRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cipher_suites: None,
            protocols: None,
            proxy_host: None,
            proxy_port: DEFAULT_PROXY_PORT,
            agent: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            keep_alive_secs: DEFAULT_KEEP_ALIVE.as_secs(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ca_files: Vec::new(),
            endpoint_identification: None,
            tunnel_fallback_direct: false,
            auth_rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let loaded = match path {
            Some(path) => confy::load_path(path),
            None => confy::load(APP_NAME, Some(CONFIG_NAME)),
        };
        loaded.map_err(|e| ConnectError::Configuration(format!("cannot load configuration: {}", e)))
    }
}

/// Parses an ordered, comma-separated allow-list of suite or protocol names.
pub fn parse_allow_list(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|entry| {
            let entry = entry.trim();
            let valid = !entry.is_empty()
                && entry
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
            if valid {
                Ok(entry.to_string())
            } else {
                Err(ConnectError::Configuration(format!("invalid allow-list entry {:?} in {:?}", entry, raw)))
            }
        })
        .collect()
}

fn parse_resolve(raw: &str) -> Result<(String, SocketAddr)> {
    let (host, addr) = raw
        .split_once('=')
        .ok_or_else(|| ConnectError::Configuration(format!("expected HOST=ADDR, got {}", raw)))?;
    let addr = addr
        .parse()
        .map_err(|e| ConnectError::Configuration(format!("invalid address in {}: {}", raw, e)))?;
    Ok((host.to_string(), addr))
}

/// Everything the client needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connector: ConnectorConfig,
    pub keep_alive: Duration,
    pub max_connections: usize,
    pub ca_files: Vec<PathBuf>,
    pub endpoint_identification: Option<EndpointIdentification>,
    pub auth_rules: Vec<AuthRule>,
    pub resolve: Vec<(String, SocketAddr)>,
}

impl Settings {
    /// Command line and environment win over the configuration file.
    pub fn new(opts: &Opts, file: Config) -> Result<Self> {
        let cipher_suites = opts.cipher_suites.as_deref().or(file.cipher_suites.as_deref());
        let protocols = opts.protocols.as_deref().or(file.protocols.as_deref());

        let proxy = match opts.proxy_host.clone().or(file.proxy_host) {
            Some(host) if !host.trim().is_empty() => ProxyDescriptor::HttpTunnel {
                host: host.trim().to_string(),
                port: opts.proxy_port.unwrap_or(file.proxy_port),
            },
            _ => ProxyDescriptor::None,
        };

        let endpoint_identification = opts
            .endpoint_identification
            .as_deref()
            .or(file.endpoint_identification.as_deref())
            .map(str::parse)
            .transpose()?;

        let mut ca_files = file.ca_files;
        ca_files.extend(opts.ca_files.iter().cloned());

        let connector = ConnectorConfig {
            user_agent: user_agent(opts.agent.as_deref().or(file.agent.as_deref())),
            proxy,
            connect_timeout: Duration::from_millis(opts.connect_timeout_ms.unwrap_or(file.connect_timeout_ms)),
            read_timeout: Duration::from_millis(opts.read_timeout_ms.unwrap_or(file.read_timeout_ms)),
            tunnel_fallback_direct: file.tunnel_fallback_direct,
            upgrade: UpgradeConfig {
                cipher_suites: cipher_suites.map(parse_allow_list).transpose()?.unwrap_or_default(),
                protocols: protocols.map(parse_allow_list).transpose()?.unwrap_or_default(),
                ..Default::default()
            },
        };

        if file.max_connections == 0 {
            return Err(ConnectError::Configuration("max_connections must be at least 1".into()));
        }

        Ok(Self {
            connector,
            keep_alive: Duration::from_secs(file.keep_alive_secs),
            max_connections: file.max_connections,
            ca_files,
            endpoint_identification,
            auth_rules: file.auth_rules,
            resolve: opts.resolve.iter().map(|r| parse_resolve(r)).collect::<Result<_>>()?,
        })
    }
}
