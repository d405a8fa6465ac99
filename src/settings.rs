use std::fmt;

/// Which upstream protocol is used to establish the outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Direct,
    Http,
    Socks4,
    Socks5,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyProtocol::Direct => "direct",
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        };
        f.write_str(s)
    }
}

/// Which transport the redirected traffic uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxiedProtocol {
    Tcp,
    Udp,
}

/// Immutable configuration shared read-only by every session. Constructed
/// once at startup and handed to workers behind an `Arc` (see `main.rs`).
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub proxy_protocol: ProxyProtocol,
    pub proxied_protocol: ProxiedProtocol,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub username: String,
    pub password: String,
}

impl ProxySettings {
    /// Validates the invariants from the data model: UDP traffic can only
    /// be proxied directly or through SOCKS5, and DIRECT carries no
    /// upstream port or credentials.
    pub fn validate(&self) -> Result<(), String> {
        if self.proxied_protocol == ProxiedProtocol::Udp
            && !matches!(self.proxy_protocol, ProxyProtocol::Direct | ProxyProtocol::Socks5)
        {
            return Err(format!(
                "UDP proxying requires direct or socks5, got {}",
                self.proxy_protocol
            ));
        }

        if self.proxy_protocol == ProxyProtocol::Direct && self.proxy_port != 0 {
            return Err("direct proxying must not specify a proxy port".to_string());
        }

        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ProxySettings {
        ProxySettings {
            proxy_protocol: ProxyProtocol::Direct,
            proxied_protocol: ProxiedProtocol::Tcp,
            proxy_host: String::new(),
            proxy_port: 0,
            username: String::new(),
            password: String::new(),
        }
    }

    #[test]
    fn udp_rejects_http_and_socks4() {
        let mut s = base();
        s.proxied_protocol = ProxiedProtocol::Udp;
        s.proxy_protocol = ProxyProtocol::Http;
        assert!(s.validate().is_err());

        s.proxy_protocol = ProxyProtocol::Socks4;
        assert!(s.validate().is_err());

        s.proxy_protocol = ProxyProtocol::Socks5;
        assert!(s.validate().is_ok());

        s.proxy_protocol = ProxyProtocol::Direct;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn direct_rejects_nonzero_port() {
        let mut s = base();
        s.proxy_port = 1080;
        assert!(s.validate().is_err());
    }
}
