#![forbid(unsafe_code)]
//! Fibercoin node: ledger, unconfirmed pool and REST API

use clap::Parser;
use fibercoin::config::load_config;
use fibercoin::node::Node;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fiber-node", version, about = "Run a fibercoin node")]
struct Args {
    /// Path to a TOML config file (defaults to ./config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the API port from the config
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(port) = args.api_port {
        config.node.api_port = port;
    }

    let node = Arc::new(Node::init(config)?);
    node.start().await?;
    Ok(())
}
