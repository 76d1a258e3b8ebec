//! SOCKS5 CONNECT without authentication (RFC 1928).

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::{ConnectError, Result};

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn rejected(reason: impl std::fmt::Display) -> ConnectError {
    ConnectError::Transport(format!("SOCKS5 proxy rejected the connection: {}", reason))
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

pub(super) fn connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| ConnectError::InvalidUrl(format!("host name too long for SOCKS5: {}", host)))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

pub(super) async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [VERSION, NO_AUTH] {
        return Err(rejected("no acceptable authentication method"));
    }

    stream.write_all(&connect_request(host, port)?).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(rejected(format!("unexpected version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(rejected(reply_reason(reply[1])));
    }

    // Bound address and port, unused.
    let remaining = match reply[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(rejected(format!("invalid address type {}", other))),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
