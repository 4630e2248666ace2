use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_chain_swap::config::Config;
use ln_chain_swap::swap::SwapRecord;
use ln_chain_swap::swap::store::{SqliteSwapStore, SwapStore};
use ln_chain_swap::version::VersionGate;
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    /// JSON config file; its `store_path` is used unless --store is given.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    List,
    ListActive,
    Get {
        #[arg(long)]
        swap_id: String,
    },
    HasActive,
    Version,
}

fn main() -> Result<()> {
    ln_chain_swap::logging::init().ok();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let path = args.store.unwrap_or(cfg.store_path);
    let store = SqliteSwapStore::open(path).context("open swap store")?;

    let out = match args.command {
        Command::List => {
            let swaps = store.list().context("list swaps")?;
            json!(swaps.iter().map(swap_json).collect::<Vec<_>>())
        }
        Command::ListActive => {
            let swaps = store.list_active().context("list active swaps")?;
            json!(swaps.iter().map(swap_json).collect::<Vec<_>>())
        }
        Command::Get { swap_id } => {
            let id = swap_id.parse().context("parse swap id")?;
            let swap = store
                .get(&id)
                .context("get swap")?
                .with_context(|| format!("swap not found: {swap_id}"))?;
            serde_json::to_value(&swap).context("serialize swap")?
        }
        Command::HasActive => {
            let active = !store.list_active().context("list active swaps")?.is_empty();
            json!({ "has_active_swaps": active })
        }
        Command::Version => {
            let store = std::sync::Arc::new(store);
            let stored = VersionGate::new(store).stored_version()?;
            json!({
              "store_version": stored,
              "binary_store_version": ln_chain_swap::version::STORE_VERSION,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn swap_json(swap: &SwapRecord) -> serde_json::Value {
    json!({
      "swap_id": swap.id.to_string(),
      "swap_type": swap.swap_type.to_string(),
      "role": swap.role.to_string(),
      "state": swap.current.as_str(),
      "peer_node_id": swap.peer_node_id,
      "asset": swap.asset.to_string(),
      "channel_id": swap.channel_id,
      "amount": swap.amount,
      "opening_tx_id": swap.opening_tx_id,
      "claim_tx_id": swap.claim_tx_id,
      "cancel_message": swap.cancel_message,
      "last_error": swap.last_error,
      "created_at": swap.created_at,
    })
}
