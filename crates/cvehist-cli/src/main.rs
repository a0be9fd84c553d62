use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cvehist_storage::{HistoryStore, MemoryStore, PgHistoryStore};
use cvehist_sync::{run_import, IngestConfig, IngestError, DEFAULT_CHECKPOINT_NAME};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cvehist")]
#[command(about = "Import the NVD CVE change history into a local database")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and store change history, resuming from the checkpoint
    Import(ImportArgs),
    /// Show the stored progress for a checkpoint
    Status {
        #[arg(long, default_value = DEFAULT_CHECKPOINT_NAME)]
        checkpoint_name: String,
    },
    /// Apply the database schema
    Migrate,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Number of results per page (max 5000)
    #[arg(long, default_value_t = 5000)]
    page_size: u32,

    /// Number of records per insert chunk within a page's transaction
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Attempts per page before the run gives up
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Name of the checkpoint that tracks progress
    #[arg(long, default_value = DEFAULT_CHECKPOINT_NAME)]
    checkpoint_name: String,

    /// Reset the checkpoint and start from the beginning
    #[arg(long)]
    reset_checkpoint: bool,

    /// Import into an in-memory store instead of the database
    #[arg(long)]
    dry_run: bool,

    /// Also print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Import(args) => import(config, args).await?,
        Commands::Status { checkpoint_name } => {
            let store = PgHistoryStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            let stored = store.record_count().await.context("counting stored records")?;
            let checkpoint = store
                .load_checkpoint(&checkpoint_name)
                .await
                .with_context(|| format!("loading checkpoint {checkpoint_name}"))?;
            match checkpoint {
                Some(checkpoint) => println!(
                    "checkpoint={} next_index={} total={} updated_at={} stored_records={}",
                    checkpoint.name,
                    checkpoint.next_index,
                    checkpoint
                        .total
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    checkpoint.updated_at.to_rfc3339(),
                    stored
                ),
                None => println!("checkpoint={checkpoint_name} not started stored_records={stored}"),
            }
        }
        Commands::Migrate => {
            let store = PgHistoryStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn import(mut config: IngestConfig, args: ImportArgs) -> Result<()> {
    config.max_retries = args.max_retries;
    config.run.page_size = args.page_size;
    config.run.chunk_size = args.batch_size;
    config.run.checkpoint_name = args.checkpoint_name.clone();
    config.run.reset_checkpoint = args.reset_checkpoint;

    let store: Arc<dyn HistoryStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            PgHistoryStore::connect(&config.database_url)
                .await
                .context("connecting to database")?,
        )
    };

    match run_import(&config, store).await {
        Ok(summary) => {
            println!(
                "import complete: run_id={} checkpoint={} pages={} fetched={} inserted={} skipped={} progress={}/{} stop={}",
                summary.run_id,
                summary.checkpoint_name,
                summary.pages,
                summary.fetched,
                summary.inserted,
                summary.skipped,
                summary.next_index,
                summary
                    .total
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                summary.stop_reason
            );
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Ok(())
        }
        Err(err) => {
            if let Some(stopped_at) = err.downcast_ref::<IngestError>().and_then(IngestError::stopped_at) {
                error!(
                    stopped_at,
                    "import stopped; rerun with the same checkpoint name to resume"
                );
            }
            Err(err)
        }
    }
}

