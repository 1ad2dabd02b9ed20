use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clientele_core::SyncType;
use clientele_enrich::GenderClassifier;
use clientele_source::{CustomerSource, FixtureSource};
use clientele_storage::{CustomerStore, PgStore};
use clientele_sync::{parse_start_date, Enricher, SyncConfig, SyncPipeline, SyncRequest};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "clientele-cli")]
#[command(about = "Customer mirror, sync and gender enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull customers from the platform into the local store.
    Sync {
        /// Ignore every watermark and pull all customers.
        #[arg(long)]
        full: bool,
        /// Lower bound for an incremental pull (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
        /// Read customers from a JSON file instead of the platform.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Classify pending customers.
    Enrich {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Clear every inferred gender and mark all customers pending.
    ResetEnrichment,
    Migrate,
    /// Run the JSON API, plus the cron scheduler when enabled.
    Serve,
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_start_date(raw).ok_or_else(|| format!("expected RFC 3339 or YYYY-MM-DD, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clientele=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        full: false,
        since: None,
        fixture: None,
    }) {
        Commands::Sync {
            full,
            since,
            fixture,
        } => {
            let pipeline = build_pipeline(config, fixture).await?;
            let request = SyncRequest {
                sync_type: if full { SyncType::Full } else { SyncType::Incremental },
                since,
            };
            let summary = pipeline.run_sync(request).await?;
            println!(
                "sync complete: run_id={} log_id={} type={} processed={} created={} updated={} \
                 failed={}",
                summary.run_id,
                summary.log_id,
                summary.sync_type.as_str(),
                summary.counters.processed,
                summary.counters.created,
                summary.counters.updated,
                summary.counters.failed
            );
        }
        Commands::Enrich { limit } => {
            let enricher = build_enricher(&config).await?;
            let outcome = enricher.enrich_pending(limit).await?;
            println!(
                "enrichment complete: processed={} enriched={} failed={}",
                outcome.processed, outcome.enriched, outcome.failed
            );
        }
        Commands::ResetEnrichment => {
            let store = connect_store(&config).await?;
            let reset = store.reset_all_enrichments().await?;
            println!("reset enrichment for {reset} customers");
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let pipeline = build_pipeline(config, None).await?;
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().sync_cron, "scheduler started");
            }
            clientele_web::serve(pipeline, port).await?;
        }
    }

    Ok(())
}

async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn build_pipeline(config: SyncConfig, fixture: Option<PathBuf>) -> Result<Arc<SyncPipeline>> {
    let store: Arc<dyn CustomerStore> = Arc::new(connect_store(&config).await?);
    let source: Arc<dyn CustomerSource> = match fixture {
        Some(path) => Arc::new(
            FixtureSource::from_json_file(&path, 250)
                .with_context(|| format!("loading fixture {}", path.display()))?,
        ),
        None => Arc::new(config.shopify_client()?),
    };
    let classifier: Arc<dyn GenderClassifier> = Arc::new(config.gender_classifier()?);
    Ok(Arc::new(SyncPipeline::new(config, store, source, classifier)))
}

async fn build_enricher(config: &SyncConfig) -> Result<Enricher> {
    let store: Arc<dyn CustomerStore> = Arc::new(connect_store(config).await?);
    config.enricher(store)
}
