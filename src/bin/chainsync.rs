#![forbid(unsafe_code)]
//! Inspect and maintain the chain state of a chainsync data directory.

use chainsync::blockchain::{hash_from_hex, BlockHeader};
use chainsync::config::{load_config, Config};
use chainsync::headers::{HeaderTree, SqliteHeaderStore};
use chainsync::node::{HEADERS_DB, UTXO_DB};
use chainsync::utxo::store::{SqliteUtxoStore, UtxoStore};
use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "chainsync", about = "Header tree and UTXO set maintenance")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "chainsync.toml")]
    config: PathBuf,

    /// Print JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Best header, UTXO head and set size
    Status,
    /// Unspent outputs of a transaction
    Utxos { txid: String },
    /// Roll the UTXO set back to a stored block
    Revert { hash: String },
    /// Drop rollback history at and below a stored block
    Prune { hash: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    chainsync::logging::init(&config.logging);

    let data_dir = Path::new(&config.storage.data_dir);
    if !data_dir.exists() {
        return Err(format!("Data directory {} does not exist", data_dir.display()).into());
    }
    let store = SqliteUtxoStore::open(data_dir.join(UTXO_DB))?;

    match cli.command {
        Command::Status => status(&config, &store, cli.json)?,
        Command::Utxos { txid } => utxos(&store, &txid, cli.json)?,
        Command::Revert { hash } => {
            let head = store.revert_to(&hash_from_hex(&hash)?)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&head)?);
            } else {
                println!("{} {}", "✅ UTXO set reverted to".green().bold(), head);
            }
        }
        Command::Prune { hash } => {
            store.truncate(&hash_from_hex(&hash)?)?;
            let pruned = store.pruned_height()?;
            if cli.json {
                println!("{}", serde_json::json!({ "pruned_height": pruned }));
            } else {
                println!(
                    "{} {}",
                    "✂️  History pruned up to height".yellow().bold(),
                    pruned.map(|h| h.to_string()).unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn status(config: &Config, store: &SqliteUtxoStore, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let genesis = BlockHeader::from_hex(&config.network.genesis)?;
    let header_store = SqliteHeaderStore::open(Path::new(&config.storage.data_dir).join(HEADERS_DB))?;
    let tree = HeaderTree::open(Box::new(header_store), genesis)?;
    let best = tree.get_best_head();
    let utxo_head = store.head()?;
    let utxo_count = store.len()?;
    let pruned = store.pruned_height()?;

    if json {
        let value = serde_json::json!({
            "best_header": { "hash": hex::encode(best.hash), "height": best.height },
            "headers": tree.len(),
            "valid_heads": tree.valid_heads().len(),
            "utxo_head": utxo_head,
            "utxo_count": utxo_count,
            "pruned_height": pruned,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Item").fg(TableColor::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Value").fg(TableColor::Cyan).add_attribute(Attribute::Bold),
        ]);
    table.add_row(vec![
        Cell::new("Best header"),
        Cell::new(format!("{} at {}", hex::encode(best.hash), best.height)).fg(TableColor::Green),
    ]);
    table.add_row(vec![Cell::new("Known headers"), Cell::new(tree.len())]);
    table.add_row(vec![Cell::new("Valid heads"), Cell::new(tree.valid_heads().len())]);
    table.add_row(vec![
        Cell::new("UTXO head"),
        match utxo_head {
            Some(head) => Cell::new(format!("{} at {}", hex::encode(head.hash), head.height)).fg(TableColor::Green),
            None => Cell::new("(empty)").fg(TableColor::Yellow),
        },
    ]);
    table.add_row(vec![Cell::new("Unspent outputs"), Cell::new(utxo_count)]);
    table.add_row(vec![
        Cell::new("History pruned to"),
        Cell::new(pruned.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string())),
    ]);

    println!("{}", "📊 Chain state".bright_cyan().bold());
    println!("{}", table);
    Ok(())
}

fn utxos(store: &SqliteUtxoStore, txid: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let tx_hash = hash_from_hex(txid)?;
    let outputs = store.get_unspent_outputs(&[tx_hash])?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
        return Ok(());
    }
    if outputs.is_empty() {
        println!("{}", "📭 No unspent outputs for this transaction".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Index").fg(TableColor::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Value").fg(TableColor::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Height").fg(TableColor::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Script").fg(TableColor::Cyan).add_attribute(Attribute::Bold),
        ]);
    for output in &outputs {
        table.add_row(vec![
            Cell::new(output.outpoint.index),
            Cell::new(output.value).fg(TableColor::Green),
            Cell::new(output.height),
            Cell::new(hex::encode(&output.script)).fg(TableColor::Grey),
        ]);
    }
    println!("{}", table);
    Ok(())
}
