#![forbid(unsafe_code)]
//! PinWallet HTTP server

use clap::Parser;
use pinwallet::api::{run_api_server, WalletService};
use pinwallet::config::{load_config, load_config_from};
use pinwallet::engine::TransferEngine;
use pinwallet::logging::init_logging;
use pinwallet::persistence::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "Serve the PinWallet REST API", long_about = None)]
struct Args {
    /// Path to a TOML config file (defaults to ./config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Port to listen on, overriding the config file
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path, overriding the config file
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db) = args.db {
        config.database.path = db;
    }
    config.validate()?;

    init_logging(&config.logging);

    if let Some(parent) = Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path, "database opened");

    let engine = TransferEngine::from_config(&config, Arc::new(db))?;
    if !config.server.trusted_proxies.is_empty() {
        tracing::info!(proxies = ?config.server.trusted_proxies, "trusting X-Forwarded-For from proxies");
    }
    let service = WalletService::new(Arc::new(engine))
        .with_trusted_proxies(config.server.trusted_proxies.clone());

    run_api_server(service, &config.server).await
}
