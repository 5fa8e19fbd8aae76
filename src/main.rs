use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use outpost::cli::{Cli, Command};
use outpost::{agent, server};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(message = "Shutdown requested.");
            shutdown.cancel();
        }
    });

    let result = match cli.command {
        Command::Server(config) => server::run(config, token).await.map_err(|error| {
            error!(message = "Server exited with error.", %error);
        }),
        Command::Agent(config) => agent::run(config, token).await.map_err(|error| {
            error!(message = "Agent exited with error.", %error);
        }),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(()) => std::process::ExitCode::FAILURE,
    }
}
