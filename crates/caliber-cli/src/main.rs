use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use caliber_ingest::{ingest, load_raw_batch};
use caliber_store::MemoryStore;
use caliber_sync::{open_json_dir_store, SyncConfig, SyncPipeline, SyncRunSummary};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "caliber-cli")]
#[command(about = "Watch price reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a raw batch and upsert it into the document store.
    Sync(SyncArgs),
    /// Merge a raw batch and print the canonical entities without touching the store.
    Parse {
        #[arg(long)]
        raw: Option<PathBuf>,
        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    raw: Option<PathBuf>,
    #[arg(long)]
    store_dir: Option<PathBuf>,
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    export_parsed: bool,
    /// Reconcile against an empty in-memory store.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(raw) = &self.raw {
            config.raw_path = raw.clone();
        }
        if let Some(store_dir) = &self.store_dir {
            config.store_dir = store_dir.clone();
        }
        if let Some(collection) = &self.collection {
            config.collection = collection.clone();
        }
        if let Some(reports_dir) = &self.reports_dir {
            config.reports_dir = reports_dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.export_parsed {
            config.export_parsed = true;
        }
    }
}

async fn sync(args: SyncArgs) -> Result<SyncRunSummary> {
    let mut config = SyncConfig::from_env();
    args.apply(&mut config);
    if args.dry_run {
        return SyncPipeline::new(config, Arc::new(MemoryStore::new()))
            .run_once()
            .await;
    }
    let store = open_json_dir_store(&config).await?;
    SyncPipeline::new(config, Arc::new(store)).run_once().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let summary = sync(args).await?;
            println!(
                "sync complete: run_id={} entities={} created={} updated={} unchanged={} failed={} skipped={} reports={}",
                summary.run_id,
                summary.entities,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.failed,
                summary.skipped_observations,
                summary.reports_dir
            );
        }
        Commands::Parse { raw, output } => {
            let raw_path = raw.unwrap_or_else(|| SyncConfig::from_env().raw_path);
            let merged = ingest(load_raw_batch(&raw_path)?);
            tracing::info!(
                entities = merged.entities.len(),
                skipped = merged.skipped.len(),
                "parsed {}",
                raw_path.display()
            );
            let json = serde_json::to_string_pretty(&merged.entities)
                .context("serializing parsed entities")?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}
