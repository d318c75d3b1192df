use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tgstats_scrape::AdsClient;
use tgstats_store::PgStore;
use tgstats_sync::{build_scheduler, CampaignSelection, CollectorConfig, Pipeline};

#[derive(Debug, Parser)]
#[command(name = "tgstats")]
#[command(about = "Telegram Ads campaign statistics collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection pass
    Collect {
        /// Comma-separated campaign ids; defaults to TGSTATS_CAMPAIGN_IDS
        #[arg(long)]
        campaigns: Option<String>,
        /// Collect every campaign currently marked active in the store
        #[arg(long, conflicts_with = "campaigns")]
        all_active: bool,
        /// Collect every campaign the store has ever seen
        #[arg(long, conflicts_with_all = ["campaigns", "all_active"])]
        all_known: bool,
    },
    /// Apply pending database migrations
    Migrate,
    /// Run the daily collection schedule in the foreground
    Schedule,
}

fn selection(
    config: &CollectorConfig,
    campaigns: Option<String>,
    all_active: bool,
    all_known: bool,
) -> Result<CampaignSelection> {
    if all_active {
        return Ok(CampaignSelection::ActiveInStore);
    }
    if all_known {
        return Ok(CampaignSelection::AllKnown);
    }
    let ids: Vec<String> = match campaigns {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        None => config.campaign_ids.clone(),
    };
    if ids.is_empty() {
        bail!(
            "no campaigns selected: pass --campaigns, --all-active, --all-known, \
             or set TGSTATS_CAMPAIGN_IDS"
        );
    }
    Ok(CampaignSelection::Explicit(ids))
}

async fn build_pipeline(config: &CollectorConfig) -> Result<Pipeline> {
    let client = AdsClient::new(config.client_config()).context("building ads client")?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    Ok(Pipeline::new(Arc::new(client), Arc::new(store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tgstats=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = CollectorConfig::from_env();

    match cli.command {
        Commands::Collect {
            campaigns,
            all_active,
            all_known,
        } => {
            let selection = selection(&config, campaigns, all_active, all_known)?;
            let pipeline = build_pipeline(&config).await?;
            // Per-campaign failures are reported in the summary, not via the
            // exit status; only a failed campaign listing aborts the run.
            let summary = pipeline.run_once(&selection).await?;
            println!(
                "collection pass complete: run_id={} attempted={} succeeded={} failed={}",
                summary.run_id, summary.attempted, summary.succeeded, summary.failed
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let selection = if config.campaign_ids.is_empty() {
                CampaignSelection::ActiveInStore
            } else {
                CampaignSelection::Explicit(config.campaign_ids.clone())
            };
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let mut sched = build_scheduler(&config.collect_cron, pipeline, selection).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.collect_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
