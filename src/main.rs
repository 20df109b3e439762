mod cli;
mod client;
mod codec;
mod index;
mod protocol;
mod server;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use client::ClientConfig;
use server::NodeConfig;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            path,
            bind,
            idle_timeout,
        } => {
            server::run_server(NodeConfig {
                bind,
                port,
                root: path,
                idle_timeout: Duration::from_secs(idle_timeout),
            })
            .await?;
        }
        Commands::Connect {
            ip,
            port,
            download_dir,
            quiet,
            timeout,
        } => {
            client::run_client(ClientConfig {
                host: ip,
                port,
                download_dir,
                quiet,
                timeout: Duration::from_secs(timeout),
            })
            .await?;
        }
    }

    Ok(())
}
