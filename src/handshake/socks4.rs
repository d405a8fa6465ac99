//! SOCKS4 handshake (TCP only, IPv4 targets only).

use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::{read_exact, write_all};
use crate::error::{Error, HandshakeErrorKind, Result};
use crate::settings::ProxySettings;

const CD_CONNECT: u8 = 0x01;
const REQUEST_GRANTED: u8 = 0x5A;

pub async fn handshake(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    target: SocketAddr,
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<()> {
    let addr_v4 = match target {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => {
            return Err(Error::handshake(
                HandshakeErrorKind::UnsupportedTarget,
                "SOCKS4 supports IPv4 targets only",
            ))
        }
    };

    let userid: &str = if !settings.username.is_empty() {
        &settings.username
    } else if !settings.password.is_empty() {
        &settings.password
    } else {
        ""
    };

    let mut request = Vec::with_capacity(9 + userid.len());
    request.push(0x04);
    request.push(CD_CONNECT);
    request.extend_from_slice(&target.port().to_be_bytes());
    request.extend_from_slice(&addr_v4.ip().octets());
    request.extend_from_slice(userid.as_bytes());
    request.push(0x00);

    write_all(upstream, &request, deadline).await?;

    let reply = read_exact(upstream, 8, deadline).await?;
    if reply[0] == 0x00 && reply[1] == REQUEST_GRANTED {
        Ok(())
    } else {
        Err(Error::handshake(HandshakeErrorKind::ProxyRejected, format!("{:#04x}", reply[1])))
    }
}
