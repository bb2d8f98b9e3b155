//! prominence-migrator - batch reclassification of stored works
//!
//! Runs migration batches for one rule version until no work needs
//! migrating, a batch fails, or Ctrl+C is pressed. Ctrl+C stops between
//! works and leaves the batch resumable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tagrank_common::config::TomlConfig;
use tagrank_common::db::init_database;
use tagrank_common::events::EventBus;
use tagrank_engine::{BatchStatus, TagEngine};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command-line arguments for prominence-migrator
#[derive(Parser, Debug)]
#[command(name = "prominence-migrator")]
#[command(about = "Reclassify tag prominence for stored works")]
#[command(version)]
struct Args {
    /// Config file (overrides TAGRANK_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file (overrides TAGRANK_DATABASE)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Rule version to migrate to (default: latest stored version)
    #[arg(short, long)]
    rule_version: Option<i64>,

    /// Works per batch (default: batch.batch_size from config)
    #[arg(short, long)]
    batch_size: Option<i64>,

    /// Classify and log decisions without writing
    #[arg(long)]
    dry_run: bool,

    /// Link universe families for the rule version before migrating
    #[arg(long)]
    link_families: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TomlConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .init();

    info!("Starting prominence-migrator v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.resolve_database_path(args.database.as_deref());
    info!("Database: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let batch_size = args.batch_size.unwrap_or(config.batch.batch_size);
    let engine = TagEngine::new(pool, Arc::new(config), EventBus::default());

    let rule_version = match args.rule_version {
        Some(version) => version,
        None => engine.latest_rule_version().await?,
    };
    info!(rule_version, batch_size, dry_run = args.dry_run, "Migration parameters");

    if args.link_families {
        if args.dry_run {
            warn!("Skipping universe family linking in dry run");
        } else {
            let report = engine.link_universe_families(rule_version).await?;
            info!(
                families_created = report.families_created,
                links_created = report.links_created,
                fandoms_matched = report.fandoms_matched,
                "Universe families linked"
            );
        }
    }

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping after the current work");
            ctrl_c_token.cancel();
        }
    });

    let mut runner = engine.batch_runner(args.dry_run);
    let results = runner
        .run_to_completion(batch_size, rule_version, &cancel)
        .await
        .context("Migration run failed")?;

    let processed: i64 = results.iter().map(|r| r.processed).sum();
    let skipped: i64 = results.iter().map(|r| r.skipped).sum();
    let errors: i64 = results.iter().map(|r| r.errors).sum();
    info!(batches = results.len(), processed, skipped, errors, "Migration run finished");

    match results.last().map(|r| r.status) {
        Some(BatchStatus::Failed) => {
            error!("Last batch failed: error rate above batch.max_error_rate");
            std::process::exit(1);
        }
        Some(BatchStatus::Cancelled) => {
            warn!("Migration cancelled; rerun to resume");
        }
        _ => {}
    }

    Ok(())
}
