use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::info;

use transfer_queue::configure::load_config;
use transfer_queue::logger;
use transfer_queue::{SledBackend, Transfer, TransferId, TransferQueueStore};

#[derive(Parser)]
#[clap(author, version, about = "Inspect and edit a transfer queue", long_about = None)]
struct Args {
    /// Overrides the configured namespace
    #[clap(long)]
    namespace: Option<String>,
    /// Overrides the configured sled path
    #[clap(long)]
    db_path: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the pending block number
    Block,
    /// Overwrite the pending block number
    SetBlock { block_number: u64 },
    /// Print the head of the queue without removing it
    Next,
    /// Queue a transfer given as JSON
    Add {
        #[clap(long)]
        json: String,
    },
    /// Remove a transfer from the queue
    Remove {
        #[clap(long)]
        block: u64,
        #[clap(long)]
        log_index: u64,
    },
    /// Look up a transfer record, queued or not
    Show {
        #[clap(long)]
        block: u64,
        #[clap(long)]
        log_index: u64,
    },
    /// Print the number of queued transfers
    Len,
    /// Drop expired entries from the database
    Purge,
}

fn print_transfer(transfer: Option<Transfer>) -> Result<()> {
    match transfer {
        Some(t) => println!("{}", serde_json::to_string_pretty(&t)?),
        None => println!("none"),
    }
    Ok(())
}

async fn run(backend: &SledBackend, store: &TransferQueueStore, command: Command) -> Result<()> {
    match command {
        Command::Block => match store.get_pending_block_number().await? {
            Some(n) => println!("{n}"),
            None => println!("none"),
        },
        Command::SetBlock { block_number } => {
            store.set_pending_block_number(block_number).await?;
            println!("pending block number set to {block_number}");
        }
        Command::Next => print_transfer(store.next_transfer().await?)?,
        Command::Add { json } => {
            let transfer: Transfer = serde_json::from_str(&json).context("invalid transfer JSON")?;
            if store.add_transfer(&transfer).await? {
                println!("queued {}", transfer.id());
            } else {
                println!("already known {}", transfer.id());
            }
        }
        Command::Remove { block, log_index } => {
            let id = TransferId::new(block, log_index);
            store.remove(&id).await?;
            println!("removed {id}");
        }
        Command::Show { block, log_index } => {
            print_transfer(store.transfer(&TransferId::new(block, log_index)).await?)?
        }
        Command::Len => println!("{}", store.pending_len().await?),
        Command::Purge => println!("purged {} expired entries", backend.purge_expired()?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();

    let mut config = load_config().context("failed to load config")?;
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    logger::setup_logger(&config).map_err(|e| anyhow::anyhow!("failed to set up logger: {e}"))?;
    info!(
        "namespace={} db_path={} ttl={}s",
        config.namespace, config.db_path, config.cache_ttl_secs
    );

    let backend = Arc::new(
        SledBackend::open(&config.db_path)
            .with_context(|| format!("failed to open queue at {}", config.db_path))?,
    );
    let store = TransferQueueStore::new(backend.clone(), &config.namespace, config.cache_ttl_secs)?;
    run(&backend, &store, args.command).await
}
