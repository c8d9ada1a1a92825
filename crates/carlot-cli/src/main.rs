use std::sync::Arc;

use anyhow::{Context, Result};
use carlot_storage::{CursorQueryEngine, ListingStore, MemoryListingStore, QueryConfig};
use carlot_sync::{connect_store, CancellationToken, RunSummary, SyncConfig, SyncPipeline};
use carlot_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "carlot-cli")]
#[command(about = "Used-car listing ingestion and retrieval")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extraction pass and exit.
    Sync {
        /// Page to start from, e.g. the `next_page` of an interrupted run.
        #[arg(long)]
        start_page: Option<u32>,
    },
    /// Run extraction passes on the configured cron schedule until Ctrl-C.
    Watch,
    /// Apply database migrations.
    Migrate,
    /// Serve the listings API.
    Serve {
        /// Serve from an empty in-process store instead of Postgres.
        #[arg(long)]
        memory: bool,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("carlot=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { start_page: None }) {
        Commands::Sync { start_page } => {
            let mut config = SyncConfig::from_env();
            if let Some(page) = start_page {
                config.worker.start_page = page;
            }
            let store = connect_store(&config).await?;
            let pipeline = SyncPipeline::carsensor(config, store)?;
            let cancel = cancel_on_ctrl_c();
            if let Some(summary) = pipeline.run_once(&cancel).await? {
                print_summary(&summary);
            }
        }
        Commands::Watch => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let store = connect_store(&config).await?;
            let pipeline = Arc::new(SyncPipeline::carsensor(config, store)?);
            let cancel = cancel_on_ctrl_c();
            let Some(mut sched) = pipeline.maybe_build_scheduler(cancel.clone()).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "watching; Ctrl-C to stop");
            cancel.cancelled().await;
            // Let a run that was already underway flush its batch before exiting.
            pipeline.wait_idle().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { memory, port } => {
            let store: Arc<dyn ListingStore> = if memory {
                warn!("serving from an in-memory store; nothing is persisted");
                Arc::new(MemoryListingStore::new())
            } else {
                connect_store(&SyncConfig::from_env()).await?
            };
            let engine = CursorQueryEngine::new(store, QueryConfig::from_env());
            let port = port.unwrap_or_else(carlot_web::web_port_from_env);
            carlot_web::serve(port, AppState::new(engine)).await?;
        }
    }

    Ok(())
}

/// Token cancelled on the first Ctrl-C. The in-flight batch still lands.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current batch");
            token.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync {:?}: run_id={} pages={} inserted={} updated={} heartbeats={} failures={}",
        summary.status,
        summary.run_id,
        summary.pages_fetched,
        summary.inserted,
        summary.updated,
        summary.heartbeats,
        summary.failures.len(),
    );
    if let Some(page) = summary.next_page {
        println!("resume with: carlot-cli sync --start-page {page}");
    }
}
