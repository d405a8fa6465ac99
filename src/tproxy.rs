//! Recovery of the pre-redirect destination for traffic a firewall has
//! sent to our listening sockets (spec §4.A). TCP uses `SO_ORIGINAL_DST`
//! on the accepted socket; UDP uses `IP_TRANSPARENT` plus the
//! `IP_RECVORIGDSTADDR`/`IPV6_RECVORIGDSTADDR` ancillary data on a
//! TPROXY-marked listener. Both are Linux-only netfilter/TPROXY facilities.

use std::io::ErrorKind;
use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::{c_int, c_void, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};
use nix::sys::socket::{
    bind, getsockopt, setsockopt,
    sockopt::{Ip6tOriginalDst, IpTransparent, OriginalDst},
    AddressFamily, SockFlag, SockProtocol, SockType, SockaddrIn, SockaddrIn6,
};
use tokio::io::Interest;
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{Error, Result};

/// Recovers the destination a TCP client originally tried to reach,
/// before a firewall rule redirected the connection to us.
pub fn recover_original_tcp_destination(stream: &TcpStream) -> Result<SocketAddr> {
    let fd = stream.as_raw_fd();
    let is_v6 = stream.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);

    if !is_v6 {
        let addr = getsockopt(fd, OriginalDst).map_err(|e| {
            Error::Environment(format!(
                "SO_ORIGINAL_DST unavailable (connection was not redirected, or platform lacks TPROXY support): {e}"
            ))
        })?;
        return Ok(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        )));
    }

    let addr = getsockopt(fd, Ip6tOriginalDst).map_err(|e| {
        Error::Environment(format!(
            "SO_ORIGINAL_DST unavailable (connection was not redirected, or platform lacks TPROXY support): {e}"
        ))
    })?;
    Ok(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(addr.sin6_addr.s6_addr),
        u16::from_be(addr.sin6_port),
        0,
        0,
    )))
}

fn sockaddr_to_socket_addr(buf: *const c_void) -> Option<SocketAddr> {
    let family = unsafe { (*(buf as *const libc::sockaddr)).sa_family as c_int };
    match family {
        libc::AF_INET => {
            let addr = unsafe { &*(buf as *const sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*(buf as *const sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                u32::from_be(addr.sin6_flowinfo),
                addr.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// A UDP socket bound with `IP_TRANSPARENT` and original-destination
/// ancillary reporting enabled, standing in for the kernel's TPROXY
/// listener (spec §4.F step 1).
pub struct TransparentUdpSocket {
    socket: UdpSocket,
}

impl TransparentUdpSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Ok(Self { socket: bind_transparent(addr)? })
    }

    /// Receives one datagram, returning its payload, the client's source
    /// endpoint, and the original destination the firewall redirected it
    /// from.
    pub async fn recv_with_orig_dst(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, SocketAddr)> {
        loop {
            self.socket.readable().await.map_err(Error::Io)?;
            match self
                .socket
                .try_io(Interest::READABLE, || recv_with_orig_dst_once(self.socket.as_raw_fd(), buf))
            {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }
}

/// A raw, unconnected UDP socket bound to `spoof_addr` with
/// `IP_TRANSPARENT` set, used to send response datagrams back to a client
/// with the original destination as their source address (spec §4.F
/// step 5) — this is what makes the reply look, to the client, like it
/// came from the server it originally tried to reach.
pub struct SpoofingUdpSocket {
    socket: UdpSocket,
}

impl SpoofingUdpSocket {
    pub fn bind(spoof_addr: SocketAddr) -> Result<Self> {
        Ok(Self { socket: bind_transparent(spoof_addr)? })
    }

    pub async fn send_to(&self, buf: &[u8], to: SocketAddr) -> Result<usize> {
        self.socket.send_to(buf, to).await.map_err(Error::Io)
    }
}

fn bind_transparent(addr: SocketAddr) -> Result<UdpSocket> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };

    let fd = nix::sys::socket::socket(
        family,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK,
        SockProtocol::Udp,
    )
    .map_err(|e| Error::Environment(format!("creating transparent UDP socket: {e}")))?;

    setsockopt(fd, IpTransparent, &true)
        .map_err(|e| Error::Environment(format!("setting IP_TRANSPARENT: {e}")))?;

    set_recv_orig_dst(fd, addr.is_ipv6())?;

    match addr {
        SocketAddr::V4(a) => bind(fd, &SockaddrIn::from(a)),
        SocketAddr::V6(a) => bind(fd, &SockaddrIn6::from(a)),
    }
    .map_err(|e| Error::Environment(format!("binding transparent socket to {addr}: {e}")))?;

    let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    UdpSocket::from_std(std_socket).map_err(Error::Io)
}

fn set_recv_orig_dst(fd: RawFd, is_v6: bool) -> Result<()> {
    let value: c_int = 1;
    let (level, optname) = if is_v6 {
        (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR)
    } else {
        (libc::SOL_IP, libc::IP_RECVORIGDSTADDR)
    };

    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const c_int as *const c_void,
            size_of::<c_int>() as socklen_t,
        )
    };

    if rc != 0 {
        return Err(Error::Environment(format!(
            "setting IP_RECVORIGDSTADDR: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Single non-blocking `recvmsg` attempt pulling the `IP_ORIGDSTADDR` /
/// `IPV6_ORIGDSTADDR` ancillary message alongside the payload. Returns
/// `WouldBlock` so the caller's `try_io` retry loop works the normal way.
fn recv_with_orig_dst_once(fd: RawFd, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
    let mut src_storage: MaybeUninit<sockaddr_storage> = MaybeUninit::zeroed();
    let mut ctrl_buf = [0u8; 128];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = src_storage.as_mut_ptr() as *mut c_void;
    msg.msg_namelen = size_of::<sockaddr_storage>() as u32;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = ctrl_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = ctrl_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let src = sockaddr_to_socket_addr(src_storage.as_ptr() as *const c_void)
        .ok_or_else(|| std::io::Error::new(ErrorKind::AddrNotAvailable, "unknown source address family"))?;

    let dst = find_orig_dst_cmsg(&msg)
        .ok_or_else(|| std::io::Error::new(ErrorKind::AddrNotAvailable, "no original destination ancillary data"))?;

    Ok((n as usize, src, dst))
}

fn find_orig_dst_cmsg(msg: &libc::msghdr) -> Option<SocketAddr> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let is_v4 = hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVORIGDSTADDR;
            let is_v6 = hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVORIGDSTADDR;
            if is_v4 || is_v6 {
                let data = libc::CMSG_DATA(cmsg) as *const c_void;
                if let Some(addr) = sockaddr_to_socket_addr(data) {
                    return Some(addr);
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_recovery_fails_without_redirect() {
        // A plain loopback connection was never passed through a
        // firewall redirect, so SO_ORIGINAL_DST must not be set.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.unwrap().0
        });
        let client = client.unwrap();
        drop(server);

        let result = recover_original_tcp_destination(&client);
        assert!(matches!(result, Err(Error::Environment(_))));
    }
}
