use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use astn_matching::{
    maybe_build_scheduler, run_queue_worker, BatchProcessor, MatchingConfig, MatchingContext,
    PgTaskQueue, RunInitiator,
};
use astn_oracle::{AnthropicConfig, AnthropicOracle};
use astn_storage::{connect_pool, PgStore};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "astn-cli")]
#[command(about = "ASTN matching pipeline command-line interface")]
struct Cli {
    /// YAML matching config; environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a match run for one profile, or for every profile with --all.
    Compute {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        profile: Option<Uuid>,
        #[arg(long)]
        all: bool,
    },
    /// Process scheduled batches from the task queue.
    Worker,
    /// Serve the JSON API.
    Serve,
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ASTN_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MatchingConfig::from_yaml_file(path)?,
        None => MatchingConfig::from_env(),
    };

    match cli.command {
        Commands::Compute { profile, all } => {
            let pool = connect_pool(&config.database_url).await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            let queue = Arc::new(PgTaskQueue::new(pool));
            let initiator = RunInitiator::new(config, MatchingContext::from_store(store, queue));
            if all {
                let started = initiator.start_all().await?;
                println!("match runs started: {started}");
            } else if let Some(profile_id) = profile {
                let summary = initiator
                    .start(profile_id)
                    .await
                    .with_context(|| format!("starting match run for {profile_id}"))?;
                println!("{}", describe_summary(&summary));
            }
        }
        Commands::Worker => {
            let pool = connect_pool(&config.database_url).await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            let queue = Arc::new(PgTaskQueue::new(pool).with_claim_timeout(config.queue_claim_timeout()));
            let oracle = Arc::new(
                AnthropicOracle::from_env(AnthropicConfig::from_env())
                    .context("building oracle client")?,
            );
            let ctx = MatchingContext::from_store(store, queue.clone());
            let processor = Arc::new(BatchProcessor::new(config.clone(), ctx.clone(), oracle));
            let initiator = Arc::new(RunInitiator::new(config.clone(), ctx));

            let cron = maybe_build_scheduler(&config, initiator).await?;
            if let Some(sched) = &cron {
                sched.start().await.context("starting recompute scheduler")?;
                info!(cron = %config.recompute_cron, "recompute scheduler started");
            }

            tokio::select! {
                _ = run_queue_worker(queue, processor, config.queue_poll_interval()) => {}
                _ = tokio::signal::ctrl_c() => info!("shutting down worker"),
            }
        }
        Commands::Serve => astn_web::serve_from_env().await?,
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url).await?;
            PgStore::new(pool).migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn describe_summary(summary: &astn_matching::RunSummary) -> String {
    match summary {
        astn_matching::RunSummary::NoCandidates { run_seq, cleared } => {
            format!("no candidate opportunities: run_seq={run_seq} cleared={cleared}")
        }
        astn_matching::RunSummary::Started {
            run_seq,
            pool_size,
            total_batches,
        } => format!("match run started: run_seq={run_seq} pool={pool_size} batches={total_batches}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn compute_needs_a_profile_or_all() {
        assert!(Cli::try_parse_from(["astn-cli", "compute"]).is_err());
        assert!(Cli::try_parse_from(["astn-cli", "compute", "--all"]).is_ok());
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["astn-cli", "--config", "m.yaml", "compute", "--profile", &id]).unwrap();
        assert!(matches!(cli.command, Commands::Compute { profile: Some(_), all: false }));
        assert!(Cli::try_parse_from(["astn-cli", "compute", "--all", "--profile", &id]).is_err());
    }
}
