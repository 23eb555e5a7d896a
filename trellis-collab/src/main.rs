//! Trellis collaboration server binary.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use trellis_collab::{CollabServer, ServerConfig};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "trellis-server")]
#[command(about = "Real-time coordination server for shared diagrams")]
struct Args {
    /// TOML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Override the RocksDB directory
    #[arg(short, long, value_name = "PATH")]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(storage) = args.storage {
        config.storage_path = Some(storage);
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str())).init();

    info!("Starting trellis-server on {}", config.bind_addr);
    if config.tokens.is_empty() {
        log::warn!("No tokens configured; every connection will be rejected");
    }
    match &config.storage_path {
        Some(path) => info!("Persisting sessions to {}", path.display()),
        None => info!("Running without persistence"),
    }

    let server = CollabServer::new(config)?;
    server.run().await
}
