//! Bidirectional TCP relay (spec §4.C).

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Buffer size for `tokio::io::copy`'s internal pump; implementation
/// choice, not wire-visible.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Pumps bytes both ways between `client` and `upstream` until both
/// directions have reached EOF. Unlike a plain race between the two
/// copies, each direction keeps running after its *peer* direction sees
/// EOF: when `client -> upstream` observes EOF, `upstream`'s write half is
/// shut down (a half-close) but `upstream -> client` keeps draining until
/// upstream itself EOFs. A read/write error on either direction tears
/// down both.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> Result<()> {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let client_to_upstream = pump(client_read, upstream_write);
    let upstream_to_client = pump(upstream_read, client_write);

    let (a, b) = tokio::join!(client_to_upstream, upstream_to_client);
    a.and(b)
}

async fn pump(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
) -> Result<()> {
    io::copy(&mut reader, &mut writer).await.map_err(Error::Io)?;
    // `copy` returning means the reader hit EOF; half-close the peer's
    // write side so the other direction can still finish naturally.
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relays_bytes_both_directions_and_closes_on_mutual_eof() {
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let client_side = tokio::spawn(async move {
            let mut sock = TcpStream::connect(client_addr).await.unwrap();
            sock.write_all(b"ping").await.unwrap();
            sock.shutdown().await.unwrap();
            let mut resp = Vec::new();
            sock.read_to_end(&mut resp).await.unwrap();
            resp
        });

        let upstream_side = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut req = Vec::new();
            sock.read_to_end(&mut req).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
            sock.shutdown().await.unwrap();
            req
        });

        let (client_conn, _) = client_listener.accept().await.unwrap();
        let upstream_conn = TcpStream::connect(upstream_addr).await.unwrap();

        relay(client_conn, upstream_conn).await.unwrap();

        assert_eq!(upstream_side.await.unwrap(), b"ping");
        assert_eq!(client_side.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn one_directional_traffic_still_completes() {
        // Upstream never writes back; client half-closes after sending.
        // The relay must still terminate once both sides have EOFed,
        // rather than hanging on the silent direction.
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let client_side = tokio::spawn(async move {
            let mut sock = TcpStream::connect(client_addr).await.unwrap();
            sock.write_all(b"hello").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let upstream_side = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut req = Vec::new();
            sock.read_to_end(&mut req).await.unwrap();
            sock.shutdown().await.unwrap();
            req
        });

        let (client_conn, _) = client_listener.accept().await.unwrap();
        let upstream_conn = TcpStream::connect(upstream_addr).await.unwrap();

        relay(client_conn, upstream_conn).await.unwrap();
        client_side.await.unwrap();
        assert_eq!(upstream_side.await.unwrap(), b"hello");
    }
}
