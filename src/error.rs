use std::fmt;

/// Error taxonomy for transproxify. Each variant maps to one of the
/// classes in the error handling design: some are fatal at startup,
/// others only close the session that triggered them while the server
/// keeps running (see `server/tcp.rs` and `server/udp.rs`).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid CLI arguments or an unparseable address. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The kernel lacks a required capability, or the ancillary data
    /// needed to recover an original destination was not present.
    #[error("environment error: {0}")]
    Environment(String),

    /// Socket read/write/connect/accept failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The upstream proxy refused the request or violated its protocol.
    #[error("upstream proxy rejected handshake: {kind} ({detail})")]
    Handshake { kind: HandshakeErrorKind, detail: String },

    /// A deadline was exceeded on a handshake or a UDP session went idle.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    pub fn handshake(kind: HandshakeErrorKind, detail: impl Into<String>) -> Self {
        Error::Handshake { kind, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeErrorKind {
    /// The upstream proxy answered with a non-success status/reply.
    ProxyRejected,
    /// No SOCKS5 method offered was acceptable to the server.
    NoAcceptableMethod,
    /// SOCKS5 username/password sub-negotiation failed.
    AuthFailed,
    /// The target address is not representable in this proxy's protocol
    /// (e.g. an IPv6 target through SOCKS4).
    UnsupportedTarget,
}

impl fmt::Display for HandshakeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeErrorKind::ProxyRejected => "ProxyRejected",
            HandshakeErrorKind::NoAcceptableMethod => "NoAcceptableMethod",
            HandshakeErrorKind::AuthFailed => "AuthFailed",
            HandshakeErrorKind::UnsupportedTarget => "UnsupportedTarget",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
