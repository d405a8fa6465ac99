//! SOCKS5 UDP ASSOCIATE: the control-channel handshake that hands back a
//! relay endpoint, plus the per-datagram frame/unframe codec used on that
//! relay endpoint for the lifetime of the association.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use super::socks5::{negotiate_methods, read_reply, write_address, write_request, CMD_UDP_ASSOCIATE};
use crate::error::{Error, HandshakeErrorKind, Result};
use crate::settings::ProxySettings;

/// Performs SOCKS5 phases 1-2 followed by an `UDP ASSOCIATE` request with
/// `DST = 0.0.0.0:0`, returning the relay endpoint the proxy assigned.
/// `control` must remain open for the association's lifetime.
pub async fn associate(
    control: &mut (impl AsyncRead + AsyncWrite + Unpin),
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<SocketAddr> {
    negotiate_methods(control, settings, deadline).await?;

    let unspecified: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    write_request(control, CMD_UDP_ASSOCIATE, unspecified, deadline).await?;

    let (rep, bound) = read_reply(control, deadline).await?;
    if rep != 0 {
        return Err(Error::handshake(HandshakeErrorKind::ProxyRejected, format!("{rep:#04x}")));
    }
    Ok(bound)
}

/// Wraps a payload for the relay endpoint: `00 00 FRAG ATYP addr port payload`.
pub fn frame(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00];
    write_address(&mut out, target);
    out.extend_from_slice(payload);
    out
}

/// Unwraps a datagram received from the relay endpoint. Returns `None`
/// (dropping the datagram) if it's fragmented or malformed.
pub fn unframe(datagram: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if datagram.len() < 4 {
        return None;
    }
    if datagram[0] != 0x00 || datagram[1] != 0x00 {
        return None;
    }
    if datagram[2] != 0x00 {
        // FRAG != 0: fragmentation is not supported.
        return None;
    }

    let atyp = datagram[3];
    let rest = &datagram[4..];
    match atyp {
        0x01 => {
            if rest.len() < 6 {
                return None;
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            Some((SocketAddr::from((ip, port)), &rest[6..]))
        }
        0x04 => {
            if rest.len() < 18 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            Some((SocketAddr::from((ip, port)), &rest[18..]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_literal_scenario_bytes() {
        let target: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let framed = frame(target, b"DATA");
        assert_eq!(
            framed,
            vec![0x00, 0x00, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35, b'D', b'A', b'T', b'A']
        );
    }

    #[test]
    fn unframe_recovers_address_and_payload() {
        let datagram = [0x00, 0x00, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35, b'R', b'E', b'S', b'P'];
        let (addr, payload) = unframe(&datagram).unwrap();
        assert_eq!(addr, "8.8.8.8:53".parse::<SocketAddr>().unwrap());
        assert_eq!(payload, b"RESP");
    }

    #[test]
    fn round_trips_for_ipv4_and_ipv6() {
        for target in ["8.8.8.8:53", "[2001:db8::1]:443"] {
            let target: SocketAddr = target.parse().unwrap();
            let framed = frame(target, b"hello world");
            let (addr, payload) = unframe(&framed).unwrap();
            assert_eq!(addr, target);
            assert_eq!(payload, b"hello world");
        }
    }

    #[test]
    fn fragmented_datagrams_are_dropped() {
        let datagram = [0x00, 0x00, 0x01, 0x01, 8, 8, 8, 8, 0x00, 0x35, b'x'];
        assert!(unframe(&datagram).is_none());
    }

    #[test]
    fn truncated_datagrams_are_dropped() {
        assert!(unframe(&[0x00, 0x00, 0x00]).is_none());
        assert!(unframe(&[0x00, 0x00, 0x00, 0x01, 1, 2, 3]).is_none());
    }
}
