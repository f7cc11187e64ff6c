mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use csync_storage::{EntityStore, MemoryStore, PgStore};
use csync_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline, MAX_CHUNK_SIZE};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "csync", version)]
#[command(about = "Keep local posts and comments in step with the remote API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and reconcile every enabled entity once
    Sync(StoreArgs),
    /// Apply pending database migrations
    Migrate,
    /// Run syncs on the configured cron schedule until interrupted
    Schedule(StoreArgs),
}

#[derive(Debug, Default, Args)]
struct StoreArgs {
    /// Use a process-local store instead of Postgres
    #[arg(long)]
    in_memory: bool,
    /// Rows per bulk write, at most 13107
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_CHUNK_SIZE as u64))]
    chunk_size: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Sync(StoreArgs::default())) {
        Commands::Sync(args) => {
            let pipeline = build_pipeline(config, &args).await?;
            match pipeline.run_once().await {
                Ok(summary) => {
                    for report in &summary.entities {
                        let c = report.counts;
                        println!(
                            "{}: fetched={} inserted={} updated={} unchanged={} skipped={}",
                            report.entity,
                            c.fetched,
                            c.inserted,
                            c.updated,
                            c.unchanged,
                            c.skipped_unresolved
                        );
                    }
                    println!("sync complete: run_id={}", summary.run_id);
                }
                Err(err) => {
                    eprintln!("sync stopped due to an unexpected error: {err:#}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule(args) => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(build_pipeline(config, &args).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                return Ok(ExitCode::FAILURE);
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn build_pipeline(mut config: SyncConfig, args: &StoreArgs) -> Result<SyncPipeline> {
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = usize::try_from(chunk_size).context("chunk size out of range")?;
    }

    let store: Arc<dyn EntityStore> = if args.in_memory {
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::connect(&config.database_url).await?;
        store.migrate().await?;
        Arc::new(store)
    };

    SyncPipeline::from_workspace(config, store).await
}
