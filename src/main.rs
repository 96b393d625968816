use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

mod aggregate;
mod classify;
mod config;
mod db;
mod enrich;
mod error;
mod ingest;
mod logging;
mod models;
mod pipeline;
mod report;
mod store;

use config::PipelineConfig;
use models::Partition;
use store::FsSnapshotStore;

#[derive(Parser)]
#[command(name = "service-gap")]
#[command(about = "Counseling service enrichment and wait-time gap rollups", long_about = None)]
struct Cli {
    /// TOML file overriding thresholds and the service taxonomy
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Append raw service records from a CSV file to the database
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Enrich raw records, compute the rollups and publish a new snapshot
    #[command(group(
        ArgGroup::new("source")
            .args(["csv", "from_db"])
            .required(true)
            .multiple(false)
    ))]
    Run {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        from_db: bool,
        /// Restrict the run to one YYYY-MM partition
        #[arg(long)]
        partition: Option<Partition>,
        #[arg(long, default_value = "snapshots")]
        store: PathBuf,
        /// Also publish the summary tables to Postgres
        #[arg(long)]
        publish_db: bool,
    },
    /// Generate a markdown report from the current snapshot
    Report {
        #[arg(long, default_value = "snapshots")]
        store: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the current snapshot's run summary
    Summary {
        #[arg(long, default_value = "snapshots")]
        store: PathBuf,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = PipelineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} raw records from {}.", csv.display());
        }
        Commands::Run {
            csv,
            from_db,
            partition,
            store,
            publish_db,
        } => {
            let pool = if from_db || publish_db {
                Some(connect().await?)
            } else {
                None
            };

            let batch = match (&csv, &pool) {
                (Some(path), _) => ingest::read_csv_path(path).map_err(|err| {
                    if err.is_schema_violation() {
                        tracing::error!(error = %err, "ingestion aborted; previous snapshot left in place");
                    }
                    anyhow::Error::new(err)
                })?,
                (None, Some(pool)) if from_db => db::fetch_raw_records(pool).await?,
                _ => anyhow::bail!("no raw-record source selected"),
            };

            let batch = match partition {
                Some(partition) => batch.restrict(partition),
                None => batch,
            };

            let output = pipeline::run(&batch, &config);
            let store = FsSnapshotStore::open(&store)?;
            let staged = store
                .stage(&output.snapshot, &output.records)
                .context("failed to stage snapshot")?;

            // CURRENT moves only once every sink has the run.
            if let Some(pool) = pool.as_ref().filter(|_| publish_db) {
                if let Err(err) = db::publish_snapshot(pool, &output.snapshot).await {
                    if let Err(cleanup) = staged.discard() {
                        tracing::warn!(error = %cleanup, "failed to discard staged snapshot");
                    }
                    return Err(err.context("postgres publish failed; previous snapshot left in place"));
                }
            }
            let path = staged.commit().context("failed to publish snapshot")?;

            let summary = &output.snapshot.summary;
            println!(
                "Run {} published to {}: {} records from {} students ({} rejected, {} duplicates).",
                summary.run_id,
                path.display(),
                summary.total_records,
                summary.unique_students,
                summary.enrichment.rejected(),
                summary.enrichment.duplicates
            );
        }
        Commands::Report { store, out, limit } => {
            let store = FsSnapshotStore::open(&store)?;
            let snapshot = store.load_current()?;
            let report = report::build_report(&snapshot, &config, limit);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Summary { store } => {
            let store = FsSnapshotStore::open(&store)?;
            let snapshot = store.load_current()?;
            println!("{}", serde_json::to_string_pretty(&snapshot.summary)?);
        }
    }

    Ok(())
}
