use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fundscout_sync::{
    normalize_opportunity, DocumentSource, JsonFileSource, MatchPipeline, SyncConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundscout-cli")]
#[command(about = "Funding opportunity matching and application-path discovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one match pass for a profile and write reports.
    Sync {
        #[arg(long)]
        profile: String,
    },
    /// Find the application path for one opportunity record.
    Discover {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        id: String,
    },
    /// Drop the cached application path for a starting URL.
    InvalidatePath {
        #[arg(long)]
        url: String,
    },
    /// Run scheduled match passes until interrupted.
    Watch {
        #[arg(long)]
        profile: String,
    },
}

fn build_pipeline() -> Result<MatchPipeline> {
    let config = SyncConfig::from_env();
    let source = JsonFileSource::new(config.workspace_root.clone());
    MatchPipeline::new(config, Box::new(source))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let pipeline = build_pipeline()?;

    match cli.command {
        Commands::Sync { profile } => {
            let summary = pipeline.run_matches(&profile).await?;
            println!(
                "match run complete: run_id={} profile={} records={} matches={} reports={}",
                summary.run_id,
                summary.profile_id,
                summary.fetched_records,
                summary.ranked_matches,
                summary.reports_dir
            );
        }
        Commands::Discover { collection, id } => {
            let source = JsonFileSource::new(SyncConfig::from_env().workspace_root);
            let docs = source
                .list_opportunities(&collection)
                .await
                .with_context(|| format!("listing collection {collection}"))?;
            let doc = docs
                .iter()
                .find(|d| d.id == id)
                .with_context(|| format!("no record {id} in collection {collection}"))?;
            let opportunity = normalize_opportunity(doc, &collection);

            let result = pipeline.discover_application_path(&opportunity).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::InvalidatePath { url } => {
            let removed = pipeline.invalidate_application_path(&url).await?;
            if removed {
                println!("cache entry removed for {url}");
            } else {
                println!("no cache entry for {url}");
            }
        }
        Commands::Watch { profile } => {
            let (tx, mut rx) = tokio::sync::mpsc::channel(8);
            let Some(scheduler) = pipeline.maybe_build_scheduler(tx).await? else {
                bail!("scheduler disabled; set FUNDSCOUT_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%profile, "watching for scheduled match runs");

            while let Some(fired_at) = rx.recv().await {
                info!(%fired_at, "scheduled match run starting");
                match pipeline.run_matches(&profile).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        matches = summary.ranked_matches,
                        "scheduled match run finished"
                    ),
                    Err(err) => error!(%err, "scheduled match run failed"),
                }
            }
        }
    }

    Ok(())
}
