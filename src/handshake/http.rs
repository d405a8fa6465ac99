//! HTTP CONNECT handshake (TCP only).

use std::net::SocketAddr;
use std::time::Instant;

use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::{format_host_port, read_line, write_all};
use crate::error::{Error, HandshakeErrorKind, Result};
use crate::settings::ProxySettings;

pub async fn handshake(
    upstream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    target: SocketAddr,
    settings: &ProxySettings,
    deadline: Instant,
) -> Result<()> {
    let host_port = format_host_port(&target);

    let mut request = format!("CONNECT {host_port} HTTP/1.1\r\nHost: {host_port}\r\n");
    if settings.has_credentials() {
        let creds = format!("{}:{}", settings.username, settings.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds.as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    write_all(upstream, request.as_bytes(), deadline).await?;

    let status_line = match read_line(upstream, 8192, deadline).await {
        Ok(line) => line,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::handshake(
                HandshakeErrorKind::ProxyRejected,
                "connection closed before status line",
            ));
        }
        Err(e) => return Err(e),
    };
    if !is_success_status_line(&status_line) {
        return Err(Error::handshake(HandshakeErrorKind::ProxyRejected, status_line));
    }

    // Drain headers until the blank line terminating the response.
    loop {
        let line = read_line(upstream, 8192, deadline).await?;
        if line.is_empty() {
            break;
        }
    }

    Ok(())
}

/// Matches `HTTP/1.\d 2\d\d .*`.
fn is_success_status_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 12
        && &bytes[0..7] == b"HTTP/1."
        && bytes[7].is_ascii_digit()
        && bytes[8] == b' '
        && bytes[9] == b'2'
        && bytes[10].is_ascii_digit()
        && bytes[11].is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ProxiedProtocol, ProxyProtocol};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn accepts_only_2xx_status_lines() {
        assert!(is_success_status_line("HTTP/1.1 200 OK"));
        assert!(is_success_status_line("HTTP/1.0 299 Nearly"));
        assert!(!is_success_status_line("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!is_success_status_line("HTTP/1.1 301 Moved"));
        assert!(!is_success_status_line("garbage"));
    }

    fn settings_with_auth() -> ProxySettings {
        ProxySettings {
            proxy_protocol: ProxyProtocol::Http,
            proxied_protocol: ProxiedProtocol::Tcp,
            proxy_host: "proxy".into(),
            proxy_port: 8080,
            username: "alice".into(),
            password: "s3cret".into(),
        }
    }

    #[tokio::test]
    async fn sends_literal_connect_request_and_succeeds() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let settings = settings_with_auth();
        let target: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            buf[..n].to_vec()
        });

        handshake(&mut client, target, &settings, deadline).await.unwrap();
        let request = server_task.await.unwrap();
        let expected = format!(
            "CONNECT {host} HTTP/1.1\r\nHost: {host}\r\nProxy-Authorization: Basic {auth}\r\n\r\n",
            host = "93.184.216.34:443",
            auth = "YWxpY2U6czNjcmV0",
        );
        assert_eq!(String::from_utf8(request).unwrap(), expected);
    }

    #[tokio::test]
    async fn rejection_status_surfaces_as_handshake_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let settings = settings_with_auth();
        let target: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let result = handshake(&mut client, target, &settings, deadline).await;
        match result {
            Err(Error::Handshake { kind, detail }) => {
                assert_eq!(kind, HandshakeErrorKind::ProxyRejected);
                assert_eq!(detail, "HTTP/1.1 407 Proxy Authentication Required");
            }
            other => panic!("expected ProxyRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn premature_close_before_status_line_surfaces_as_handshake_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let settings = settings_with_auth();
        let target: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let result = handshake(&mut client, target, &settings, deadline).await;
        match result {
            Err(Error::Handshake { kind, detail }) => {
                assert_eq!(kind, HandshakeErrorKind::ProxyRejected);
                assert_eq!(detail, "connection closed before status line");
            }
            other => panic!("expected ProxyRejected, got {other:?}"),
        }
    }
}
