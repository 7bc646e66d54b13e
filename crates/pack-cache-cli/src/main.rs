//! pack-cache - inspect and maintain a local pack cache directory
//!
//! Operates directly on the files, so it is safe to run while backup
//! processes are using the same cache.

mod commands;
mod config;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{load_options, parse_size};
use crate::error::Result;

#[derive(Parser)]
#[command(name = "pack-cache", version, about = "Inspect and maintain a local pack cache")]
struct Cli {
    /// Cache directory (falls back to PACK_CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Size limit for cached blocks, e.g. "500M", "10G" (falls back to PACK_CACHE_MAX_SIZE)
    #[arg(long, value_parser = parse_size)]
    max_size: Option<u64>,

    /// Print results as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show file counts and sizes of both caches
    Info,
    /// Evict the oldest cached blocks until under the size limit
    Sweep,
    /// Remove all cached blocks
    Clear,
    /// Delete committed index blobs unused for over an hour
    ExpireIndex {
        /// Index blob ids still in use
        #[arg(long = "keep")]
        keep: Vec<String>,
    },
}

fn print<T: Serialize + std::fmt::Debug>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{:#?}", value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = EnvFilter::from_default_env().add_directive("pack_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let options = load_options(cli.cache_dir, cli.max_size, |key| std::env::var(key).ok())?;
    info!(options = ?options, "loaded cache configuration");

    match cli.command {
        Command::Info => print(&commands::info(&options).await?, cli.json),
        Command::Sweep => print(&commands::sweep(&options).await?, cli.json),
        Command::Clear => print(&commands::clear(&options).await?, cli.json),
        Command::ExpireIndex { keep } => {
            let removed = commands::expire_index(&options, &keep).await?;
            print(&serde_json::json!({ "removed": removed }), cli.json)
        }
    }
}
