//! obsctl entry point.

mod app;
mod cli;
mod config;
mod report;
mod target;

use std::sync::Arc;

use clap::Parser;
use obsctl_transfer::SharedTransferState;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::Config;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log.level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting obsctl");

    let shared = Arc::new(SharedTransferState::new());
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config, shared))
}

async fn run(command: Command, config: Config, shared: Arc<SharedTransferState>) -> anyhow::Result<()> {
    let interrupt = Arc::clone(&shared);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, letting running parts finish");
            interrupt.cancel();
        }
    });

    match command {
        Command::Cp(args) => {
            tokio::task::spawn_blocking(move || app::copy(&args, &config, shared)).await?
        }
    }
}
