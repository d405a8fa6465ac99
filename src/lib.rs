pub mod cli;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod relay;
pub mod server;
pub mod settings;
pub mod tproxy;
pub mod udp_session;
