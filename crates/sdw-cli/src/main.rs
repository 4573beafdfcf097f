use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sdw_core::default_watermark;
use sdw_etl::{
    connect_postgres_pipeline, fixture_pipeline, run_once_from_env, EtlConfig, RunSummary,
};
use sdw_storage::{connect_with_backoff, BackoffPolicy, Table};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sdw-cli")]
#[command(about = "Sales warehouse ETL command-line interface")]
struct Cli {
    /// Adds a debug directive on top of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once against Postgres, or against a fixture bundle in memory
    Run {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Apply the bundled SQL migrations
    Migrate,
    /// Run on the configured cron schedule until interrupted
    Schedule,
    /// Schema-check a fixture bundle and print its row counts
    CheckFixture { path: PathBuf },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} status={} processed={} rejected={} loaded={} reports={}",
        summary.run_id,
        summary.status.as_str(),
        summary.counters.processed,
        summary.counters.rejected,
        summary.counters.loaded,
        summary.reports_dir.as_deref().unwrap_or("-")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Run { fixture: None }) {
        Commands::Run { fixture: None } => {
            print_summary(&run_once_from_env().await?);
        }
        Commands::Run {
            fixture: Some(path),
        } => {
            let config = EtlConfig::from_env()?;
            let (pipeline, warehouse) = fixture_pipeline(config, path)?;
            print_summary(&pipeline.run_once().await?);
            for table in [Table::DimCustomer, Table::DimProduct, Table::DimDate, Table::FactSales] {
                println!("{}: {} rows", table.name(), warehouse.row_count(table)?);
            }
        }
        Commands::Migrate => {
            let config = EtlConfig::from_env()?;
            let backoff = BackoffPolicy {
                max_retries: config.connect_retries,
                ..BackoffPolicy::default()
            };
            let pool = connect_with_backoff(&config.database_url, backoff).await?;
            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = EtlConfig::from_env()?;
            let pipeline = Arc::new(connect_postgres_pipeline(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled; set SDW_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::CheckFixture { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let batch = sdw_adapters::parse_fixture_bundle(&text, default_watermark())?;
            println!(
                "{}: customers={} products={} sales={}",
                path.display(),
                batch.customers.len(),
                batch.products.len(),
                batch.sales.len()
            );
        }
    }

    Ok(())
}
