//! floodnet directory daemon
//!
//! Usage:
//!   floodnet-directory --listen-port 6666
//!
//! Settings come from the `[directory]` section of the config file, with
//! command-line flags applied on top. Runs until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use floodnet::{ConfigFile, Directory};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Directory that tracks live floodnet routers
#[derive(Parser, Debug)]
#[command(name = "floodnet-directory", version, about)]
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
        .directory
        .unwrap_or_default();

    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if let Some(max_workers) = cli.max_workers {
        config.max_workers = max_workers;
    }

    let directory = Directory::start(&config).await.context("starting directory")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("shutting down");
    directory.shutdown().await;
    Ok(())
}
