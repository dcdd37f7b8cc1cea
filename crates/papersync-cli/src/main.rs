use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use papersync_core::{
    run_month_for, PaperQuery, RunStatus, DEFAULT_PAGE_SIZE, HOT_PHRASE_LIMIT,
};
use papersync_storage::{Catalog, StoreError, STALE_RUN_MESSAGE};
use papersync_sync::{build_driver, SyncConfig};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "papersync-cli")]
#[command(about = "Monthly arXiv catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync in the foreground.
    Sync {
        /// Fetch and rank without writing to the catalog.
        #[arg(long)]
        dry_run: bool,
        /// Where to write the dry-run JSON report.
        #[arg(long, requires = "dry_run")]
        output: Option<PathBuf>,
        /// Read papers from a JSON bundle instead of arXiv.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Period label, e.g. 2024-05. Defaults to the current month.
        #[arg(long)]
        month: Option<String>,
    },
    /// Create the catalog schema.
    Migrate,
    /// Serve the JSON API (and the scheduler when enabled).
    Serve,
    /// Print the latest run with its papers.
    Latest,
    /// Search papers.
    Papers {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: u32,
        #[arg(long)]
        keyword: Option<String>,
    },
    HotPhrases {
        #[arg(long, default_value_t = HOT_PHRASE_LIMIT)]
        limit: usize,
    },
    /// List recent runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Remove a finished run record. Its papers stay in the catalog.
    DeleteRun { run_id: Uuid },
    /// Mark a run left `running` by a dead process as failed, releasing admission.
    FailRun {
        run_id: Uuid,
        #[arg(long, default_value = STALE_RUN_MESSAGE)]
        reason: String,
    },
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_catalog(config: &SyncConfig) -> Result<Catalog> {
    Catalog::connect(&config.database_url)
        .await
        .with_context(|| format!("opening catalog {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        output: None,
        fixture: None,
        month: None,
    });

    match command {
        Commands::Sync {
            dry_run,
            output,
            fixture,
            month,
        } => {
            if fixture.is_some() {
                config.fixture_path = fixture;
            }
            let run_month = month.unwrap_or_else(|| run_month_for(Utc::now()));
            let driver = build_driver(&config).await?;

            if dry_run {
                let report = driver.dry_run(&run_month, output.as_deref()).await?;
                info!(
                    run_month = %report.run_month,
                    papers = report.total_papers,
                    hot_phrases = %report.hot_phrases.join(", "),
                    "dry run finished"
                );
                return Ok(());
            }

            match driver.run_once(&run_month).await? {
                Some(run) if run.status == RunStatus::Completed => info!(
                    run_id = %run.id,
                    total = run.total_papers,
                    new = run.new_papers_count,
                    hot_phrases = %run.hot_phrases.join(", "),
                    "sync completed"
                ),
                Some(run) => warn!(
                    run_id = %run.id,
                    status = %run.status,
                    error = run.error_message.as_deref().unwrap_or_default(),
                    "sync did not complete"
                ),
                None => anyhow::bail!("a sync run is already in progress"),
            }
        }
        Commands::Migrate => {
            open_catalog(&config).await?;
            info!(database_url = %config.database_url, "catalog schema ready");
        }
        Commands::Serve => papersync_web::serve_from_env().await?,
        Commands::Latest => {
            let catalog = open_catalog(&config).await?;
            match catalog.latest_run_with_papers().await {
                Ok(latest) => print_json(&latest)?,
                Err(StoreError::NotFound(_)) => println!("no crawl run recorded yet"),
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Papers {
            skip,
            limit,
            keyword,
        } => {
            let catalog = open_catalog(&config).await?;
            let page = catalog
                .list_papers(&PaperQuery::new(skip, limit, keyword))
                .await?;
            print_json(&page)?;
        }
        Commands::HotPhrases { limit } => {
            let catalog = open_catalog(&config).await?;
            print_json(&catalog.list_hot_phrases(limit).await?)?;
        }
        Commands::Runs { limit } => {
            let catalog = open_catalog(&config).await?;
            print_json(&catalog.list_runs(limit).await?)?;
        }
        Commands::DeleteRun { run_id } => {
            let catalog = open_catalog(&config).await?;
            catalog.delete_run(run_id).await?;
            info!(%run_id, "deleted run");
        }
        Commands::FailRun { run_id, reason } => {
            let catalog = open_catalog(&config).await?;
            let run = catalog.fail_run(run_id, &reason).await?;
            info!(%run_id, status = %run.status, "run marked failed");
        }
    }

    Ok(())
}
