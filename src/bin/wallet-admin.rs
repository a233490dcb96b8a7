#![forbid(unsafe_code)]
//! Administrative wallet operations against the PinWallet database.

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use pinwallet::config::{load_config, load_config_from, Config};
use pinwallet::engine::TransferEngine;
use pinwallet::ledger::{Wallet, WalletId, WalletStatus};
use pinwallet::logging::init_logging;
use pinwallet::money::format_minor;
use pinwallet::persistence::Database;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path, overriding the config file
    #[arg(long, global = true)]
    db: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Creates a wallet; the PIN is prompted for
    Create {
        /// Owning user id
        #[arg(long)]
        owner: i64,
    },
    /// Shows one wallet
    Show { id: i64 },
    /// Lists wallets
    List {
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Shows the transfer history of a wallet, newest first
    History {
        id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Blocks all balance changes on a wallet
    Freeze { id: i64 },
    /// Re-activates a frozen wallet
    Unfreeze { id: i64 },
    /// Closes a wallet permanently
    Close { id: i64 },
    /// Deletes a wallet record
    Delete { id: i64 },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    // keep stdout clean for tables unless asked otherwise
    if std::env::var("RUST_LOG").is_err() {
        config.logging.level = "warn".to_string();
    }
    init_logging(&config.logging);

    let engine = open_engine(&config)?;
    let ledger = engine.ledger();

    match cli.command {
        Commands::Create { owner } => {
            let pin = rpassword::prompt_password("New 4-digit PIN: ")?;
            let confirm = rpassword::prompt_password("Confirm PIN: ")?;
            if pin != confirm {
                eprintln!("{}", "❌ PINs do not match".red().bold());
                std::process::exit(1);
            }
            let wallet = ledger.create(owner, &pin)?;
            println!(
                "{} {}",
                "✅ Created wallet".bright_green().bold(),
                wallet.id.to_string().bright_yellow()
            );
            print_wallets(&[wallet]);
        }
        Commands::Show { id } => {
            let wallet = ledger.get(WalletId(id))?;
            print_wallets(&[wallet]);
        }
        Commands::List { offset, limit } => {
            let wallets = ledger.list(offset, limit)?;
            if wallets.is_empty() {
                println!("{}", "📭 No wallets found".yellow());
            } else {
                print_wallets(&wallets);
            }
        }
        Commands::History { id, limit } => {
            let wallet_id = WalletId(id);
            let records = ledger.transfers_for(wallet_id, limit)?;
            if records.is_empty() {
                println!("{}", "📭 No transfers found".yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(header(&["#", "Direction", "Counterparty", "Amount", "Date"]));

            for record in &records {
                let (direction, counterparty, color) = if record.to_wallet == wallet_id {
                    match record.from_wallet {
                        None => ("Deposit", "-".to_string(), TableColor::Cyan),
                        Some(from) => ("Received", from.to_string(), TableColor::Green),
                    }
                } else {
                    ("Sent", record.to_wallet.to_string(), TableColor::Red)
                };
                table.add_row(vec![
                    Cell::new(record.id),
                    Cell::new(direction).fg(color),
                    Cell::new(counterparty),
                    Cell::new(format_minor(record.amount)).fg(color),
                    Cell::new(record.timestamp.format("%Y-%m-%d %H:%M:%S")),
                ]);
            }
            println!("{table}");
        }
        Commands::Freeze { id } => {
            let wallet = ledger.set_status(WalletId(id), WalletStatus::Frozen)?;
            println!("{} {}", "🧊 Frozen wallet".bright_blue().bold(), wallet.id);
        }
        Commands::Unfreeze { id } => {
            let wallet = ledger.set_status(WalletId(id), WalletStatus::Active)?;
            println!("{} {}", "✅ Re-activated wallet".bright_green().bold(), wallet.id);
        }
        Commands::Close { id } => {
            let wallet = ledger.set_status(WalletId(id), WalletStatus::Closed)?;
            println!("{} {}", "🔒 Closed wallet".bright_red().bold(), wallet.id);
        }
        Commands::Delete { id } => {
            let wallet = ledger.delete(WalletId(id))?;
            println!(
                "{} {} (balance was {})",
                "🗑️  Deleted wallet".bright_red().bold(),
                wallet.id,
                format_minor(wallet.balance)
            );
        }
    }

    Ok(())
}

fn open_engine(config: &Config) -> Result<TransferEngine, Box<dyn std::error::Error>> {
    let db = Database::open(&config.database.path).map_err(|e| {
        eprintln!("{}", "❌ Could not open wallet database".red().bold());
        eprintln!("   {}", config.database.path.yellow());
        e
    })?;
    Ok(TransferEngine::from_config(config, Arc::new(db))?)
}

fn header(titles: &[&str]) -> Vec<Cell> {
    titles
        .iter()
        .map(|t| {
            Cell::new(*t)
                .fg(TableColor::Cyan)
                .add_attribute(Attribute::Bold)
        })
        .collect()
}

fn print_wallets(wallets: &[Wallet]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header(&["ID", "Owner", "Balance", "Status", "Created"]));

    for wallet in wallets {
        let status_color = match wallet.status {
            WalletStatus::Active => TableColor::Green,
            WalletStatus::Frozen => TableColor::Blue,
            WalletStatus::Closed => TableColor::Red,
        };
        table.add_row(vec![
            Cell::new(wallet.id),
            Cell::new(wallet.owner_id),
            Cell::new(format_minor(wallet.balance)),
            Cell::new(wallet.status).fg(status_color),
            Cell::new(wallet.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!("{table}");
}
