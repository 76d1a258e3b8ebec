use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::debug;
use url::Url;

use crate::domain::{ConnectError, ReadyConnection, DEFAULT_HTTPS_PORT};

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    fn keeps_alive(&self) -> bool {
        !self
            .headers
            .get_all(CONNECTION)
            .iter()
            .any(|v| v.to_str().map_or(false, |v| v.eq_ignore_ascii_case("close")))
    }
}

fn request_error(err: impl std::fmt::Display) -> ConnectError {
    ConnectError::Transport(format!("HTTP exchange failed: {}", err))
}

/// Sends one HTTP/1.1 request over `conn`. The connection is handed back
/// when the server left it open and nothing is left unread.
pub async fn send(
    conn: ReadyConnection,
    method: Method,
    url: &Url,
    user_agent: &str,
) -> crate::domain::Result<(HttpResponse, Option<ReadyConnection>)> {
    let host = match url.port() {
        Some(port) if port != DEFAULT_HTTPS_PORT => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        _ => url.host_str().unwrap_or_default().to_string(),
    };
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, host)
        .header(USER_AGENT, user_agent)
        .body(Empty::<Bytes>::new())
        .map_err(request_error)?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(conn))
        .await
        .map_err(request_error)?;

    let exchange = async move {
        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok::<_, hyper::Error>(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    };
    let (response, parts) = tokio::join!(exchange, connection.without_shutdown());
    let response = response.map_err(request_error)?;

    let reusable = match parts {
        Ok(parts) if parts.read_buf.is_empty() && response.keeps_alive() => Some(parts.io.into_inner()),
        Ok(_) => None,
        Err(e) => {
            debug!("connection unusable after exchange: {}", e);
            None
        }
    };
    Ok((response, reusable))
}
