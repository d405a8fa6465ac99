//! Upstream-proxy handshake engines (HTTP CONNECT, SOCKS4, SOCKS5, direct).
//! Each engine brings a TCP socket already connected to the upstream proxy
//! (or, for direct, to the target itself) into a state where application
//! payload can be pumped across it verbatim.

pub mod direct;
pub mod http;
pub mod socks4;
pub mod socks5;
pub mod socks5_udp;

use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::settings::{ProxyProtocol, ProxySettings};

/// Runs the handshake selected by `settings.proxy_protocol` against an
/// already-connected upstream socket, readying it for the target endpoint.
pub async fn handshake(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    target: SocketAddr,
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<()> {
    match settings.proxy_protocol {
        ProxyProtocol::Direct => direct::handshake(),
        ProxyProtocol::Http => http::handshake(upstream, target, settings, deadline).await,
        ProxyProtocol::Socks4 => socks4::handshake(upstream, target, settings, deadline).await,
        ProxyProtocol::Socks5 => socks5::handshake(upstream, target, settings, deadline).await,
    }
}
