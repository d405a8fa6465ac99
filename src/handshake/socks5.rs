//! SOCKS5 handshake: method negotiation, optional username/password
//! sub-negotiation, and the CONNECT request. Shared with
//! `socks5_udp`, which reuses [`negotiate_methods`] and
//! [`write_address`]/[`read_bound_address`] for its ASSOCIATE variant.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::{read_exact, write_all};
use crate::error::{Error, HandshakeErrorKind, Result};
use crate::settings::ProxySettings;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
pub(super) const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_V4: u8 = 0x01;
const ATYP_V6: u8 = 0x04;

pub async fn handshake(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    target: SocketAddr,
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<()> {
    negotiate_methods(upstream, settings, deadline).await?;
    write_request(upstream, CMD_CONNECT, target, deadline).await?;
    let (rep, _bound) = read_reply(upstream, deadline).await?;
    if rep != 0 {
        return Err(Error::handshake(HandshakeErrorKind::ProxyRejected, format!("{rep:#04x}")));
    }
    Ok(())
}

/// Phase 1 (method negotiation) and, if the proxy chooses user/pass,
/// phase 2 (sub-negotiation). Shared by the CONNECT and UDP ASSOCIATE
/// request flows, which differ only in phase 3.
pub(super) async fn negotiate_methods(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<()> {
    let mut methods = vec![METHOD_NONE];
    if settings.has_credentials() {
        methods.push(METHOD_USERPASS);
    }

    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(&methods);
    write_all(upstream, &greeting, deadline).await?;

    let reply = read_exact(upstream, 2, deadline).await?;
    let chosen = reply[1];
    if chosen == METHOD_NO_ACCEPTABLE || !methods.contains(&chosen) {
        return Err(Error::handshake(
            HandshakeErrorKind::NoAcceptableMethod,
            format!("{chosen:#04x}"),
        ));
    }

    if chosen == METHOD_USERPASS {
        sub_negotiate(upstream, settings, deadline).await?;
    }

    Ok(())
}

async fn sub_negotiate(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<()> {
    let user = settings.username.as_bytes();
    let pass = settings.password.as_bytes();

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(0x01);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    write_all(upstream, &req, deadline).await?;

    let reply = read_exact(upstream, 2, deadline).await?;
    if reply[1] != 0 {
        return Err(Error::handshake(HandshakeErrorKind::AuthFailed, format!("{:#04x}", reply[1])));
    }
    Ok(())
}

/// Writes a phase-3 request: `05 <cmd> 00 <ATYP> <addr> <port>`.
pub(super) async fn write_request(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    cmd: u8,
    addr: SocketAddr,
    deadline: Instant,
) -> Result<()> {
    let mut req = vec![VERSION, cmd, 0x00];
    write_address(&mut req, addr);
    write_all(upstream, &req, deadline).await
}

pub(super) fn write_address(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.push(ATYP_V4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(ATYP_V6);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Reads `05 <rep> 00 <ATYP> <addr> <port>`, returning `(rep, bound_addr)`.
pub(super) async fn read_reply(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    deadline: Instant,
) -> Result<(u8, SocketAddr)> {
    let header = read_exact(upstream, 4, deadline).await?;
    let rep = header[1];
    let atyp = header[3];

    let bound = match atyp {
        ATYP_V4 => {
            let bytes = read_exact(upstream, 4 + 2, deadline).await?;
            let ip = std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            SocketAddr::from((ip, port))
        }
        ATYP_V6 => {
            let bytes = read_exact(upstream, 16 + 2, deadline).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            SocketAddr::from((ip, port))
        }
        0x03 => {
            // Domain name (FQDN) bound address: length-prefixed, not used
            // by this proxy's request types but legal on the wire.
            let len = read_exact(upstream, 1, deadline).await?[0] as usize;
            let _name = read_exact(upstream, len + 2, deadline).await?;
            return Err(Error::handshake(
                HandshakeErrorKind::ProxyRejected,
                "unexpected domain-name bound address",
            ));
        }
        other => {
            return Err(Error::handshake(
                HandshakeErrorKind::ProxyRejected,
                format!("unknown ATYP {other:#04x}"),
            ))
        }
    };

    Ok((rep, bound))
}
