//! Zarr query tool.
//!
//! Hosts the zarr connector from the command line: lists the tables below a
//! root group, prints their schemas, scans row ranges as JSON lines and
//! issues access grants for individual objects.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::QueryConfig;
use zarr_processor::{Connector, Predicate, RowRange, ZarrConnector};

#[derive(Parser, Debug)]
#[command(name = "zarr-query")]
#[command(about = "Query Zarr arrays in an object store as tables")]
struct Args {
    /// Configuration file path (YAML with `store:` and `processor:`)
    #[arg(short, long, env = "ZARR_QUERY_CONFIG")]
    config: Option<PathBuf>,

    /// Bucket holding the root group
    #[arg(long)]
    bucket: Option<String>,

    /// Object key prefix of the root group
    #[arg(long)]
    key: Option<String>,

    /// Custom endpoint URL
    #[arg(long)]
    url: Option<String>,

    /// Cloud region, or signing region for a custom endpoint
    #[arg(long)]
    region: Option<String>,

    /// Read without credentials
    #[arg(long)]
    anonymous: bool,

    /// Log level
    #[arg(long, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List schema names
    Schemas,
    /// List tables below the root group
    Tables,
    /// Print the schema of a table
    Schema { table: String },
    /// Scan rows of a table as JSON lines
    Scan {
        table: String,
        /// First row (inclusive)
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Last row (exclusive); defaults to the end of the table
        #[arg(long)]
        end: Option<u64>,
        /// Stop after this many rows
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Print an access grant for an object key below the root group
    Sign { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args);

    let mut config = QueryConfig::load(args.config.as_deref())?;
    apply_flags(&mut config, &args);

    let connector = ZarrConnector::from_store_config(&config.store, config.processor.clone())
        .context("failed to create connector")?;

    match args.command {
        Command::Schemas => print_json(&connector.list_schema_names())?,
        Command::Tables => print_json(&connector.list_tables().await?)?,
        Command::Schema { table } => print_json(&connector.get_schema(&table).await?)?,
        Command::Scan {
            table,
            start,
            end,
            limit,
        } => scan(&connector, &table, start, end, limit).await?,
        Command::Sign { key } => print_json(&connector.access_grant(&key).await?)?,
    }

    Ok(())
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Command-line flags win over the file and the environment.
fn apply_flags(config: &mut QueryConfig, args: &Args) {
    if let Some(bucket) = &args.bucket {
        config.store.bucket = bucket.clone();
    }
    if let Some(key) = &args.key {
        config.store.key = key.clone();
    }
    if let Some(url) = &args.url {
        config.store.url = Some(url.clone());
    }
    if let Some(region) = &args.region {
        config.store.region = Some(region.clone());
    }
    if args.anonymous {
        config.store.anonymous = Some(true);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn scan(
    connector: &ZarrConnector,
    table: &str,
    start: u64,
    end: Option<u64>,
    limit: Option<u64>,
) -> Result<()> {
    let mut range = RowRange::new(start, end.unwrap_or(u64::MAX));
    if let Some(limit) = limit {
        range = range.intersect(&RowRange::new(start, start.saturating_add(limit)));
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling scan");
            interrupt.cancel();
        }
    });

    let mut batches = connector
        .open_scan(table, &Predicate::RowRange(range), cancel)
        .await?;

    let mut rows = 0u64;
    while let Some(batch) = batches.next().await {
        let batch = batch?;
        for row in batch.to_json_rows() {
            println!("{}", serde_json::to_string(&row)?);
        }
        rows += batch.num_rows() as u64;
    }

    let stats = connector.cache_stats();
    info!(
        table,
        rows,
        chunk_misses = stats.misses,
        chunk_fills = stats.fills,
        cache_bytes = stats.memory_bytes,
        "Scan complete"
    );
    Ok(())
}
