//! Command-line interface (spec §6): argument parsing, password prompting,
//! and assembly of a validated [`ProxySettings`].

use clap::Parser;

use crate::error::{Error, Result};
use crate::settings::{ProxiedProtocol, ProxyProtocol, ProxySettings};

#[derive(Parser, Debug)]
#[command(name = "transproxify", about = "Transparent TCP/UDP proxy bridge")]
pub struct Cli {
    /// Upstream proxy protocol.
    #[arg(short = 't', value_enum, default_value_t = CliProxyProtocol::Http)]
    proxy_type: CliProxyProtocol,

    /// Protocol of the redirected traffic being proxied.
    #[arg(short = 'r', value_enum, default_value_t = CliProxiedProtocol::Tcp)]
    proxied_protocol: CliProxiedProtocol,

    /// Username for upstream proxy authentication.
    #[arg(short = 'u', default_value = "")]
    username: String,

    /// Password for upstream proxy authentication.
    #[arg(short = 'P', default_value = "")]
    password: String,

    /// Prompt for the password on the terminal, with echo disabled.
    #[arg(short = 'p')]
    prompt_password: bool,

    /// Hostname or literal address of the upstream proxy.
    proxy_host: String,

    /// TCP port of the upstream proxy (ignored, must be 0, for direct).
    proxy_port: u16,

    /// Local port that redirected traffic arrives on.
    listen_port: u16,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliProxyProtocol {
    Direct,
    Http,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliProxiedProtocol {
    Tcp,
    Udp,
}

impl Cli {
    /// Parses `argv`, prompting for a password if `-p` was given, and
    /// builds a validated [`ProxySettings`].
    pub fn into_settings(self) -> Result<(ProxySettings, u16)> {
        let password = if self.prompt_password {
            rpassword::prompt_password("Password: ")
                .map_err(|e| Error::Config(format!("reading password: {e}")))?
        } else {
            self.password
        };

        let settings = ProxySettings {
            proxy_protocol: match self.proxy_type {
                CliProxyProtocol::Direct => ProxyProtocol::Direct,
                CliProxyProtocol::Http => ProxyProtocol::Http,
                CliProxyProtocol::Socks4 => ProxyProtocol::Socks4,
                CliProxyProtocol::Socks5 => ProxyProtocol::Socks5,
            },
            proxied_protocol: match self.proxied_protocol {
                CliProxiedProtocol::Tcp => ProxiedProtocol::Tcp,
                CliProxiedProtocol::Udp => ProxiedProtocol::Udp,
            },
            proxy_host: self.proxy_host,
            proxy_port: if matches!(self.proxy_type, CliProxyProtocol::Direct) { 0 } else { self.proxy_port },
            username: self.username,
            password,
        };

        settings.validate().map_err(Error::Config)?;

        Ok((settings, self.listen_port))
    }
}
