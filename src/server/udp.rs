//! UDP server loop (spec §4.F): receive on the transparent listener,
//! recover the original destination, forward through the session table,
//! periodically sweep idle sessions.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::settings::ProxySettings;
use crate::tproxy::TransparentUdpSocket;
use crate::udp_session::{UdpSessionTable, IDLE_TIMEOUT};

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(IDLE_TIMEOUT.as_secs() / 4);

pub async fn run(listen_port: u16, settings: Arc<ProxySettings>, shutdown: CancellationToken) -> Result<()> {
    let socket = TransparentUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port)))?;
    info!("udp listener bound to 0.0.0.0:{listen_port}");

    let mut table = UdpSessionTable::new(settings);
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            received = socket.recv_with_orig_dst(&mut buf) => {
                match received {
                    Ok((n, client_endpoint, original_destination)) => {
                        if let Err(e) = table.forward(client_endpoint, original_destination, &buf[..n]).await {
                            warn!("dropping datagram from {client_endpoint}: {e}");
                        }
                    }
                    Err(e) => warn!("udp receive error: {e}"),
                }
            }
            _ = sweep.tick() => {
                table.sweep(IDLE_TIMEOUT);
            }
            _ = shutdown.cancelled() => {
                info!("udp server shutting down ({} active sessions dropped)", table.len());
                return Ok(());
            }
        }
    }
}
