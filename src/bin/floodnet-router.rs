//! floodnet router daemon
//!
//! Usage:
//!   floodnet-router --directory-address dir.example.net --hop-limit 5
//!
//! Settings come from the `[router]` section of the config file, with
//! command-line flags applied on top. Runs until Ctrl+C, then sends a
//! `disconnect` to the directory.

use anyhow::{Context, Result};
use clap::Parser;
use floodnet::{ConfigFile, NodeBuilder};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Router that floods broadcasts through the overlay
#[derive(Parser, Debug)]
#[command(name = "floodnet-router", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', value_name = "PATH", env = "FLOODNET_CONFIG")]
    config: Option<PathBuf>,

    /// TCP and UDP listen port
    #[arg(long, short = 'p', value_name = "PORT")]
    listen_port: Option<u16>,

    /// Maximum concurrent request handlers
    #[arg(long, short = 'w', value_name = "N")]
    max_workers: Option<usize>,

    /// Directory host name or address
    #[arg(long, short = 'd', value_name = "HOST", env = "FLOODNET_DIRECTORY")]
    directory_address: Option<String>,

    /// Directory port
    #[arg(long, short = 'P', value_name = "PORT")]
    directory_port: Option<u16>,

    /// Drop broadcasts that arrive with this many hops (1-9)
    #[arg(long, short = 'm', value_name = "N")]
    hop_limit: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(ConfigFile::default_path);
    let mut config = ConfigFile::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?
        .router
        .unwrap_or_default();

    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if let Some(max_workers) = cli.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(address) = cli.directory_address {
        config.directory_address = address;
    }
    if let Some(port) = cli.directory_port {
        config.directory_port = port;
    }
    if let Some(hop_limit) = cli.hop_limit {
        config.hop_limit = hop_limit;
    }

    let mut node = NodeBuilder::new()
        .with_config(config)
        .build()
        .context("invalid router configuration")?;
    node.start().await.context("starting router")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("shutting down");
    node.stop().await?;
    Ok(())
}
