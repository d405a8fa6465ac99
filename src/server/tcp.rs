//! TCP server loop (spec §4.E): accept, recover original destination, run
//! the configured handshake engine, relay.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::endpoint::DEFAULT_HANDSHAKE_DEADLINE;
use crate::error::{Error, Result};
use crate::handshake;
use crate::relay::relay;
use crate::settings::{ProxyProtocol, ProxySettings};

pub async fn run(listen_port: u16, settings: Arc<ProxySettings>, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    info!("tcp listener bound to 0.0.0.0:{listen_port}");

    loop {
        let (client, client_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => {
                info!("tcp server shutting down");
                return Ok(());
            }
        };

        let settings = settings.clone();
        let session_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = handle_connection(client, settings) => {
                    if let Err(e) = result {
                        warn!("session for {client_addr} closed with error: {e}");
                    }
                }
                _ = session_shutdown.cancelled() => {}
            }
        });
    }
}

async fn handle_connection(client: TcpStream, settings: Arc<ProxySettings>) -> Result<()> {
    let original_destination = match crate::tproxy::recover_original_tcp_destination(&client) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("failed to recover original destination: {e}");
            return Err(e);
        }
    };

    let mut upstream = connect_upstream(&settings, original_destination).await?;

    let deadline = tokio::time::Instant::now() + DEFAULT_HANDSHAKE_DEADLINE;
    if let Err(e) = handshake::handshake(&mut upstream, original_destination, &settings, deadline.into()).await {
        error!("handshake to {original_destination} failed: {e}");
        return Err(e);
    }

    relay(client, upstream).await
}

async fn connect_upstream(settings: &ProxySettings, target: SocketAddr) -> Result<TcpStream> {
    let dial_target = match settings.proxy_protocol {
        ProxyProtocol::Direct => target,
        ProxyProtocol::Http | ProxyProtocol::Socks4 | ProxyProtocol::Socks5 => {
            resolve_proxy_addr(settings)?
        }
    };

    tokio::time::timeout(DEFAULT_HANDSHAKE_DEADLINE, TcpStream::connect(dial_target))
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {dial_target}")))?
        .map_err(Error::Io)
}

fn resolve_proxy_addr(settings: &ProxySettings) -> Result<SocketAddr> {
    crate::endpoint::parse_textual_address(&format!("{}:{}", settings.proxy_host, settings.proxy_port))
        .or_else(|_| {
            // Not a literal address; a real deployment would resolve this
            // via DNS. `std::net::ToSocketAddrs` handles both forms, so
            // fall back to it here instead of failing outright.
            use std::net::ToSocketAddrs;
            (settings.proxy_host.as_str(), settings.proxy_port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
                .ok_or_else(|| Error::Config(format!("cannot resolve proxy host {}", settings.proxy_host)))
        })
}
