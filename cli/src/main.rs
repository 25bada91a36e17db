//! chainloader CLI: inspect persisted loader state.
//!
//! # Commands
//! ```bash
//! chainloader info
//! chainloader status --events ./events.db --views ./views.db
//! chainloader events --events ./events.db --limit 20
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainloader_core::read_model::ReadStore;
use chainloader_core::store::EventStore;
use chainloader_core::{LoaderConfig, NetworkAggregate};
use chainloader_storage::{SqliteEventStore, SqliteReadStore};

#[derive(Parser)]
#[command(
    name = "chainloader",
    about = "Event-sourced chain loader: ChainLoader CLI",
    long_about = "
ChainLoader CLI: inspect the network aggregate and the read model of a
persisted loader.

ENVIRONMENT VARIABLES:
  CHAINLOADER_AGGREGATE_ID      Aggregate identity (default: network)
  CHAINLOADER_MAX_WINDOW_SIZE   Chain window byte budget used for hydration
  RUST_LOG                      Log filter (overrides --verbose)
",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show defaults and available backends
    Info,

    /// Hydrate the aggregate and compare it with the read side
    Status {
        /// SQLite event store
        #[arg(long)]
        events: String,
        /// SQLite read store
        #[arg(long)]
        views: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the tail of the event history
    Events {
        /// SQLite event store
        #[arg(long)]
        events: String,
        /// Number of events to show
        #[arg(long, default_value_t = 20)]
        limit: u64,
        /// Print payloads
        #[arg(long)]
        payload: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Status { events, views, json } => cmd_status(&events, views.as_deref(), json).await,
        Commands::Events {
            events,
            limit,
            payload,
        } => cmd_events(&events, limit, payload).await,
    }
}

fn cmd_info() -> Result<()> {
    let cfg = LoaderConfig::default();
    println!("ChainLoader v{}", env!("CARGO_PKG_VERSION"));
    println!("  Aggregate id: {}", cfg.aggregate_id);
    println!("  Chain window: {} MiB", cfg.max_window_size / (1024 * 1024));
    println!("  Mapper workers: {} (chunking: {})", cfg.workers_count, cfg.chunking);
    println!("  Aggregate cache TTL: {} ms", cfg.cache_ttl_ms);
    println!("  Provider timeout: {} ms", cfg.provider_timeout_ms);
    println!("  Snapshot interval: every {} events", cfg.snapshot_interval);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    Ok(())
}

async fn cmd_status(events_path: &str, views_path: Option<&str>, json: bool) -> Result<()> {
    let cfg = LoaderConfig::from_env().context("invalid CHAINLOADER_* configuration")?;
    let store = SqliteEventStore::open(events_path)
        .await
        .with_context(|| format!("opening event store {events_path}"))?;

    let snapshot = store.load_snapshot(&cfg.aggregate_id).await?;
    let after = snapshot.as_ref().map(|s| s.version).unwrap_or(0);
    let records = store.load_events(&cfg.aggregate_id, after).await?;
    let aggregate = NetworkAggregate::hydrate(&cfg.aggregate_id, cfg.max_window_size, snapshot, &records)
        .context("replaying event log")?;

    let read_height = match views_path {
        Some(path) => {
            let views = SqliteReadStore::open(path)
                .await
                .with_context(|| format!("opening read store {path}"))?;
            Some(views.last_block_height().await?)
        }
        None => None,
    };

    let chain = aggregate.chain();
    if json {
        let status = serde_json::json!({
            "aggregate_id": aggregate.id(),
            "version": aggregate.version(),
            "status": aggregate.status(),
            "window": {
                "floor": chain.floor_height(),
                "tip": chain.last_block_height(),
                "tip_hash": chain.tip().map(|b| b.hash.clone()),
                "blocks": chain.len(),
                "size": chain.size(),
            },
            "read_height": read_height,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Aggregate:   {} (version {})", aggregate.id(), aggregate.version());
    println!("Status:      {}", aggregate.status());
    match (chain.floor_height(), chain.tip()) {
        (Some(floor), Some(tip)) => {
            println!("Window:      {floor}..={} ({} blocks, {} bytes)", tip.height, chain.len(), chain.size());
            println!("Tip hash:    {}", tip.hash);
        }
        _ => println!("Window:      empty"),
    }
    if let Some(height) = read_height {
        println!("Read side:   last_block_height = {height}");
        if let Some(tip) = chain.last_block_height() {
            if height < tip as i64 {
                println!("             behind the write side; next init truncates the window to {height}");
            }
        }
    }
    Ok(())
}

async fn cmd_events(events_path: &str, limit: u64, payload: bool) -> Result<()> {
    let cfg = LoaderConfig::from_env().context("invalid CHAINLOADER_* configuration")?;
    let store = SqliteEventStore::open(events_path)
        .await
        .with_context(|| format!("opening event store {events_path}"))?;

    let records = store.tail(&cfg.aggregate_id, limit).await?;
    if records.is_empty() {
        println!("No events for '{}'", cfg.aggregate_id);
        return Ok(());
    }

    println!("{:>8}  {:<24}  {}", "VERSION", "TYPE", "TIMESTAMP");
    for record in records {
        println!(
            "{:>8}  {:<24}  {}",
            record.version,
            record.event_type,
            record.timestamp.to_rfc3339()
        );
        if payload {
            println!("{}", serde_json::to_string_pretty(&record.payload)?);
        }
    }
    Ok(())
}
