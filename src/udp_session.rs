//! UDP session table (spec §4.D): maps a client's source endpoint to the
//! upstream socket carrying its traffic, evicting sessions that go idle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::endpoint::DEFAULT_HANDSHAKE_DEADLINE;
use crate::error::{Error, Result};
use crate::handshake::socks5_udp;
use crate::settings::{ProxyProtocol, ProxySettings};
use crate::tproxy::SpoofingUdpSocket;

/// Default UDP session idle timeout (spec §5).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

enum Upstream {
    Direct { socket: Arc<UdpSocket> },
    Socks5 {
        /// Kept open only so its closure tears down the association on
        /// the proxy's side when the session is evicted; never read from
        /// or written to after the initial handshake.
        _control: TcpStream,
        socket: Arc<UdpSocket>,
    },
}

pub struct UdpSession {
    pub original_destination: SocketAddr,
    upstream: Upstream,
    last_activity: Arc<Mutex<Instant>>,
    reader: JoinHandle<()>,
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl UdpSession {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock().unwrap())
    }

    async fn send(&self, original_destination: SocketAddr, payload: &[u8]) -> Result<()> {
        match &self.upstream {
            Upstream::Direct { socket } => {
                socket.send_to(payload, original_destination).await?;
            }
            Upstream::Socks5 { socket, .. } => {
                let framed = socks5_udp::frame(original_destination, payload);
                socket.send(&framed).await?;
            }
        }
        Ok(())
    }
}

pub struct UdpSessionTable {
    sessions: HashMap<SocketAddr, UdpSession>,
    settings: Arc<ProxySettings>,
}

impl UdpSessionTable {
    pub fn new(settings: Arc<ProxySettings>) -> Self {
        Self { sessions: HashMap::new(), settings }
    }

    /// Sends `payload`, which arrived from `client_endpoint` redirected
    /// from `original_destination`, creating a session if needed.
    pub async fn forward(
        &mut self,
        client_endpoint: SocketAddr,
        original_destination: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        if let Some(existing) = self.sessions.get(&client_endpoint) {
            if existing.original_destination != original_destination {
                info!("udp session {client_endpoint} changed destination, recreating");
                self.sessions.remove(&client_endpoint);
            }
        }

        if !self.sessions.contains_key(&client_endpoint) {
            let session = self.create(client_endpoint, original_destination).await?;
            self.sessions.insert(client_endpoint, session);
        }

        let session = self.sessions.get(&client_endpoint).expect("just inserted");
        session.touch();
        session.send(original_destination, payload).await
    }

    /// Evicts sessions idle for longer than `idle_timeout`, closing their
    /// sockets. Must be called at least every `idle_timeout / 4`.
    pub fn sweep(&mut self, idle_timeout: Duration) {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|endpoint, session| {
            let keep = session.idle_for(now) <= idle_timeout;
            if !keep {
                debug!("evicting idle udp session for {endpoint}");
            }
            keep
        });
        if before != self.sessions.len() {
            debug!("udp session sweep: {} -> {}", before, self.sessions.len());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    async fn create(
        &self,
        client_endpoint: SocketAddr,
        original_destination: SocketAddr,
    ) -> Result<UdpSession> {
        let deadline = tokio::time::Instant::now() + DEFAULT_HANDSHAKE_DEADLINE;

        let (upstream, recv_socket) = match self.settings.proxy_protocol {
            ProxyProtocol::Direct => {
                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                (Upstream::Direct { socket: socket.clone() }, socket)
            }
            ProxyProtocol::Socks5 => {
                let mut control = timeout(
                    DEFAULT_HANDSHAKE_DEADLINE,
                    TcpStream::connect((self.settings.proxy_host.as_str(), self.settings.proxy_port)),
                )
                .await
                .map_err(|_| Error::Timeout("connecting to SOCKS5 proxy".into()))??;

                let relay_addr =
                    socks5_udp::associate(&mut control, &self.settings, deadline.into()).await?;
                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                socket.connect(relay_addr).await?;
                (Upstream::Socks5 { _control: control, socket: socket.clone() }, socket)
            }
            // Validated at startup (`ProxySettings::validate`): UDP proxying
            // never reaches here with HTTP or SOCKS4 configured.
            _ => unreachable!("udp proxying requires direct or socks5"),
        };

        let is_socks5 = matches!(upstream, Upstream::Socks5 { .. });
        let spoofer = Arc::new(SpoofingUdpSocket::bind(original_destination)?);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let reader = spawn_reader(recv_socket, is_socks5, client_endpoint, spoofer, last_activity.clone());

        Ok(UdpSession { original_destination, upstream, last_activity, reader })
    }
}

/// Drains `upstream`'s replies and forwards each one back to
/// `client_endpoint`, spoofing the original destination as source
/// (spec §4.F step 5). SOCKS5 replies are length-framed and must be
/// unwrapped; DIRECT replies are passed through unchanged.
fn spawn_reader(
    socket: Arc<UdpSocket>,
    is_socks5: bool,
    client_endpoint: SocketAddr,
    spoofer: Arc<SpoofingUdpSocket>,
    last_activity: Arc<Mutex<Instant>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("udp upstream read error for {client_endpoint}: {e}");
                    return;
                }
            };

            let payload: &[u8] = if is_socks5 {
                match socks5_udp::unframe(&buf[..n]) {
                    Some((_addr, payload)) => payload,
                    None => continue,
                }
            } else {
                &buf[..n]
            };

            if spoofer.send_to(payload, client_endpoint).await.is_err() {
                warn!("failed spoofing reply to {client_endpoint}");
                return;
            }
            *last_activity.lock().unwrap() = Instant::now();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_evicts_only_past_the_idle_timeout() {
        let settings = Arc::new(ProxySettings {
            proxy_protocol: ProxyProtocol::Direct,
            proxied_protocol: crate::settings::ProxiedProtocol::Udp,
            proxy_host: String::new(),
            proxy_port: 0,
            username: String::new(),
            password: String::new(),
        });
        let mut table = UdpSessionTable::new(settings);
        assert_eq!(table.len(), 0);
        table.sweep(Duration::from_secs(60));
        assert_eq!(table.len(), 0);
    }
}
