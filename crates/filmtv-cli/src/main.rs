use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use filmtv_core::BroadcastEvent;
use filmtv_sync::{Stores, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "filmtv")]
#[command(about = "Film-on-TV guide sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the guide window, reconcile, match and archive history.
    Sync,
    /// Replace the catalog mirror from the gzip title and rating dumps.
    ImportCatalog {
        #[arg(long)]
        titles: Option<PathBuf>,
        #[arg(long)]
        ratings: Option<PathBuf>,
    },
    /// Link one broadcast event to a catalog title.
    MatchManual { event_id: i64, catalog_id: String },
    /// Create or upgrade the three stores.
    Migrate,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

fn describe(event: &BroadcastEvent) -> String {
    format!(
        "event {} \"{}\" -> {} ({})",
        event.id(),
        event.schedule.title,
        event.catalog_id().unwrap_or("-"),
        event.certification.status()
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = filmtv_sync::run_sync_once(config).await?;
            let report = &summary.report;
            let matched = report.matching.map(|m| m.matched()).unwrap_or(0);
            let archived = report.archive.map(|a| a.archived).unwrap_or(0);
            println!(
                "sync complete: run_id={} days={} matched={} archived={} reports={}",
                report.run_id,
                report.days.len(),
                matched,
                archived,
                summary.reports_dir.display()
            );
        }
        Commands::ImportCatalog { titles, ratings } => {
            if let Some(titles) = titles {
                config.catalog_titles_path = titles;
            }
            if let Some(ratings) = ratings {
                config.catalog_ratings_path = ratings;
            }
            let summary = filmtv_sync::import_catalog(&config).await?;
            println!(
                "catalog import complete: titles={} alternates={} ratings={} malformed={}",
                summary.titles.titles,
                summary.titles.alternates,
                summary.ratings.updated,
                summary.titles.malformed + summary.ratings.malformed
            );
        }
        Commands::MatchManual { event_id, catalog_id } => {
            let event = filmtv_sync::assign_manual(&config, event_id, &catalog_id).await?;
            println!("{}", describe(&event));
        }
        Commands::Migrate => {
            Stores::open(&config).await?;
            info!("stores migrated");
            println!("migrations applied");
        }
    }

    Ok(())
}
