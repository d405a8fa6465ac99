use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout_at;

use crate::error::{Error, Result};

/// Default deadline for upstream-proxy handshakes (spec §4.A).
pub const DEFAULT_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

/// Parses a textual socket address (`1.2.3.4:80`, `[::1]:443`, etc). Used
/// for the `PROXY_HOST`/`PROXY_PORT` CLI arguments when the host is a
/// literal address rather than a hostname.
pub fn parse_textual_address(s: &str) -> Result<SocketAddr> {
    s.parse::<SocketAddr>()
        .map_err(|_| Error::Config(format!("invalid socket address: {s}")))
}

/// Textual form of an endpoint for use in HTTP CONNECT's request line and
/// `Host:` header: IPv6 literals are bracketed, IPv4 and hostnames are not.
pub fn format_host_port(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(a) => format!("{}:{}", a.ip(), a.port()),
        SocketAddr::V6(a) => format!("[{}]:{}", a.ip(), a.port()),
    }
}

/// Reads exactly `n` bytes before `deadline`, or fails with `Error::Io` /
/// `Error::Timeout` on short read, peer close mid-frame, or expiry.
pub async fn read_exact(
    socket: &mut (impl AsyncRead + Unpin),
    n: usize,
    deadline: Instant,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    match timeout_at(deadline.into(), socket.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Ok(buf),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout(format!("reading {n} bytes"))),
    }
}

/// Writes the full buffer before `deadline`, or fails the same way as
/// [`read_exact`].
pub async fn write_all(
    socket: &mut (impl AsyncWrite + Unpin),
    bytes: &[u8],
    deadline: Instant,
) -> Result<()> {
    match timeout_at(deadline.into(), socket.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout(format!("writing {} bytes", bytes.len()))),
    }
}

/// Reads a single line (up to and including `\n`) before `deadline`, one
/// byte at a time — used for HTTP CONNECT's status line and headers,
/// which are not length-prefixed. Lines are capped at `max_len` to bound
/// a misbehaving proxy's memory footprint.
pub async fn read_line(
    socket: &mut (impl AsyncRead + Unpin),
    max_len: usize,
    deadline: Instant,
) -> Result<String> {
    let mut line = Vec::new();
    loop {
        if line.len() >= max_len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line too long",
            )));
        }
        let byte = read_exact(socket, 1, deadline).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_and_ipv6() {
        assert_eq!(
            parse_textual_address("1.2.3.4:80").unwrap(),
            "1.2.3.4:80".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_textual_address("[2001:db8::1]:443").unwrap(),
            "[2001:db8::1]:443".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(parse_textual_address("not-an-address").is_err());
        assert!(parse_textual_address("example.com:443").is_err());
    }

    #[test]
    fn formats_ipv6_bracketed() {
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(format_host_port(&v6), "[2001:db8::1]:443");

        let v4: SocketAddr = "10.0.0.5:22".parse().unwrap();
        assert_eq!(format_host_port(&v4), "10.0.0.5:22");
    }

    #[tokio::test]
    async fn read_exact_times_out() {
        let (mut client, _server) = tokio::io::duplex(16);
        let deadline = Instant::now() + Duration::from_millis(20);
        let result = read_exact(&mut client, 4, deadline).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
