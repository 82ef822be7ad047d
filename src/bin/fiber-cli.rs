#![forbid(unsafe_code)]
//! Offline inspection tool for a fibercoin data directory

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use fibercoin::coin::droplets_to_string;
use fibercoin::config::{load_config, Config};
use fibercoin::crypto::{hash_from_hex, Address, KeyPair};
use fibercoin::persistence::Database;
use fibercoin::transaction::Transaction;
use fibercoin::visor::{unix_now, Visor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fiber-cli", version, about = "Inspect a fibercoin ledger")]
struct Cli {
    /// Path to a TOML config file (defaults to ./config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the chain head, unspent count and snapshot root
    Status,
    /// Show one unspent output by id
    Uxout { id: String },
    /// Show a block by sequence number
    Block { seq: u64 },
    /// List unspent outputs owned by an address
    Outputs { address: String },
    /// Show which distribution addresses are locked
    Distribution {
        /// Unix time to evaluate at (defaults to now)
        #[arg(long)]
        at: Option<u64>,
    },
    /// Verify a hex-encoded transaction read from a file
    Verify { file: PathBuf },
    /// Generate fresh key pairs and their addresses
    Addressgen {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| {
            Cell::new(n)
                .fg(TableColor::Cyan)
                .add_attribute(Attribute::Bold)
        })
        .collect()
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn open_visor(config: &Config) -> Result<Visor, Box<dyn std::error::Error>> {
    let db = Database::open(config.database_path())?;
    Ok(Visor::open(config, Arc::new(db))?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Addressgen { count } => {
            let mut table = new_table();
            table.set_header(header(&["Address", "Public key", "Secret key"]));
            for _ in 0..count {
                let kp = KeyPair::generate();
                table.add_row(vec![
                    Cell::new(kp.address().to_string()).fg(TableColor::Green),
                    Cell::new(hex::encode(kp.public_key_bytes())),
                    Cell::new(hex::encode(kp.secret_key.secret_bytes())),
                ]);
            }
            println!("{table}");
            return Ok(());
        }
        Command::Distribution { at } => {
            let config = load_config(cli.config.as_deref())?;
            let policy = config.lock_policy()?;
            let now = at.unwrap_or_else(unix_now);
            let unlocked = policy.unlocked_count(now);

            println!(
                "{} {}/{} addresses unlocked",
                "Distribution:".bright_cyan().bold(),
                unlocked,
                policy.distribution().len()
            );
            match policy.next_unlock_time(now) {
                Some(t) => println!(
                    "Next unlock at {} (in {})",
                    t,
                    humantime::format_duration(Duration::from_secs(t.saturating_sub(now)))
                ),
                None => println!("{}", "All distribution addresses are unlocked".green()),
            }

            let mut table = new_table();
            table.set_header(header(&["#", "Address", "State"]));
            for (i, addr) in policy.distribution().addresses.iter().enumerate() {
                let state = if policy.is_locked(addr, now) {
                    Cell::new("locked").fg(TableColor::Red)
                } else {
                    Cell::new("unlocked").fg(TableColor::Green)
                };
                table.add_row(vec![Cell::new(i), Cell::new(addr.to_string()), state]);
            }
            println!("{table}");
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;
    let visor = open_visor(&config)?;

    match cli.command {
        Command::Status => {
            let mut table = new_table();
            table.set_header(header(&["Field", "Value"]));
            match visor.head() {
                Some(h) => {
                    table.add_row(vec!["Head seq".to_string(), h.seq.to_string()]);
                    table.add_row(vec!["Head hash".to_string(), hex::encode(h.hash)]);
                    table.add_row(vec!["Head time".to_string(), h.time.to_string()]);
                }
                None => {
                    table.add_row(vec!["Head".to_string(), "none".to_string()]);
                }
            }
            table.add_row(vec![
                "Unspent outputs".to_string(),
                visor.ledger().unspent().len().to_string(),
            ]);
            table.add_row(vec![
                "Snapshot root".to_string(),
                hex::encode(visor.snapshot_root()),
            ]);
            println!("{table}");
        }
        Command::Uxout { id } => {
            let id = hash_from_hex(&id)?;
            match visor.get_output(&id) {
                Some(ux) => {
                    let mut table = new_table();
                    table.set_header(header(&["Field", "Value"]));
                    table.add_row(vec!["Source tx".to_string(), hex::encode(ux.src_transaction)]);
                    table.add_row(vec!["Index".to_string(), ux.output_index.to_string()]);
                    table.add_row(vec!["Address".to_string(), ux.address.to_string()]);
                    table.add_row(vec!["Coins".to_string(), droplets_to_string(ux.coins)]);
                    table.add_row(vec!["Hours".to_string(), ux.hours.to_string()]);
                    table.add_row(vec!["Block seq".to_string(), ux.block_seq.to_string()]);
                    println!("{table}");
                }
                None => println!("{}", "Output not found".yellow()),
            }
        }
        Command::Block { seq } => match visor.get_block(seq)? {
            Some(block) => {
                println!(
                    "{} {} {}",
                    "Block".bright_cyan().bold(),
                    seq,
                    hex::encode(block.hash()).dimmed()
                );
                println!("time {}  fee {}", block.header.time, block.header.fee);
                let mut table = new_table();
                table.set_header(header(&["Txid", "Inputs", "Outputs", "Coins out"]));
                for tx in &block.transactions {
                    let coins = tx
                        .output_coins()
                        .map(droplets_to_string)
                        .unwrap_or_else(|_| "overflow".to_string());
                    table.add_row(vec![
                        tx.hash_str(),
                        tx.inputs.len().to_string(),
                        tx.outputs.len().to_string(),
                        coins,
                    ]);
                }
                println!("{table}");
            }
            None => println!("{}", "Block not found".yellow()),
        },
        Command::Outputs { address } => {
            let address: Address = address.parse()?;
            let head_time = visor.head().map(|h| h.time).unwrap_or(0);
            let mut table = new_table();
            table.set_header(header(&["Uxid", "Coins", "Hours", "Block"]));
            for ux in visor.ledger().unspent().outputs_for_address(&address) {
                table.add_row(vec![
                    hex::encode(ux.id()),
                    droplets_to_string(ux.coins),
                    ux.coin_hours(head_time).unwrap_or(ux.hours).to_string(),
                    ux.block_seq.to_string(),
                ]);
            }
            println!("{table}");
        }
        Command::Verify { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let tx = Transaction::from_hex(raw.trim())?;
            match visor.verify(&tx) {
                Ok(verified) => println!(
                    "{} {} fee {}",
                    "valid".green().bold(),
                    hex::encode(verified.txid),
                    verified.fee
                ),
                Err(e) => {
                    println!("{} {} ({:?})", "invalid".red().bold(), e, e.class());
                    std::process::exit(1);
                }
            }
        }
        Command::Addressgen { .. } | Command::Distribution { .. } => {}
    }

    Ok(())
}
