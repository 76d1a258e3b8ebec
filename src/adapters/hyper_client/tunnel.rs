use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ACCEPT, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, error};

use crate::domain::{ConnectError, Result, DEFAULT_HTTPS_PORT};
use crate::ports::{BoxedStream, TunnelPort, TunnelRequest};

const ACCEPT_ANY: &str = "text/html, image/gif, image/jpeg, *; q=.2, */*; q=.2";

fn tunnel_error(err: impl std::fmt::Display) -> ConnectError {
    ConnectError::Tunnel(err.to_string())
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn host_header(host: &str, port: u16) -> String {
    if port == DEFAULT_HTTPS_PORT {
        authority(host, port)
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_default()
    } else {
        authority(host, port)
    }
}

pub(super) fn connect_request(host: &str, port: u16, request: &TunnelRequest) -> Result<Request<Empty<Bytes>>> {
    let mut builder = Request::connect(authority(host, port))
        .header(HOST, host_header(host, port))
        .header(USER_AGENT, request.user_agent.as_str())
        .header(ACCEPT, ACCEPT_ANY)
        .header("Proxy-Connection", "keep-alive");
    if let Some(credentials) = &request.proxy_authorization {
        let mut value = HeaderValue::from_str(credentials).map_err(tunnel_error)?;
        value.set_sensitive(true);
        builder = builder.header(PROXY_AUTHORIZATION, value);
    }
    builder.body(Empty::new()).map_err(tunnel_error)
}

/// Opens CONNECT tunnels with a hyper HTTP/1 client connection.
#[derive(Debug, Clone, Default)]
pub struct HyperTunnel;

impl HyperTunnel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TunnelPort for HyperTunnel {
    async fn establish(
        &self,
        stream: BoxedStream,
        host: &str,
        port: u16,
        request: &TunnelRequest,
    ) -> Result<BoxedStream> {
        let req = connect_request(host, port, request)?;

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .title_case_headers(true)
            .handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(tunnel_error)?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                error!("Proxy connection failed: {}", e);
            }
        });

        debug!("CONNECT {}", req.uri());
        let res = sender.send_request(req).await.map_err(tunnel_error)?;
        if res.status() != StatusCode::OK {
            return Err(ConnectError::Tunnel(format!(
                "Unable to tunnel through proxy. Proxy returns \"{:?} {}\"",
                res.version(),
                res.status()
            )));
        }

        let upgraded = hyper::upgrade::on(res).await.map_err(tunnel_error)?;
        debug!("tunnel to {} established", authority(host, port));
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}
