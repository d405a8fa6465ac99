use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::error;
use tokio_util::sync::CancellationToken;

use transproxify::cli::Cli;
use transproxify::server;
use transproxify::settings::ProxiedProtocol;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let (settings, listen_port) = match Cli::parse().into_settings() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let settings = Arc::new(settings);
    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.cancel();
        }
    });

    let result = match settings.proxied_protocol {
        ProxiedProtocol::Tcp => server::tcp::run(listen_port, settings, shutdown).await,
        ProxiedProtocol::Udp => server::udp::run(listen_port, settings, shutdown).await,
    };

    // A server loop returning normally (shutdown requested) is not an
    // error; only a startup failure surfaces here as `Err`.
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
