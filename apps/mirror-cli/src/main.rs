//! # mirror - Record Mirror CLI
//!
//! Command line interface for running and inspecting syncs.
//!
//! ## Commands
//! ```text
//! mirror sync                      every enabled entity, default window
//! mirror sync tickets --days 30    one entity, 30 day window
//! mirror sync --full               full listing + deletion check
//! mirror status                    checkpoints and latest runs
//! mirror entities                  the entity catalog
//! mirror config [--write]          effective configuration
//! ```
//!
//! Exits non-zero when any run FAILED. Ctrl-C cancels every run at its
//! next page boundary.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirror_core::{catalog, transform, EntityType};
use mirror_db::Database;
use mirror_sync::{
    source, MirrorConfig, RunOptions, SyncError, SyncOrchestrator, SyncScheduler,
};

#[derive(Parser)]
#[command(name = "mirror")]
#[command(about = "Record Mirror - incremental sync of a REST API into SQLite")]
#[command(version)]
struct Cli {
    /// Config file (default: platform config dir / mirror.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync entities from the API.
    Sync {
        /// Entities to sync (default: every enabled entity).
        entities: Vec<String>,

        /// Walk every page and archive rows deleted upstream.
        #[arg(long, conflicts_with = "days")]
        full: bool,

        /// Incremental window in days.
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show checkpoints and recent runs.
    Status {
        /// Number of runs to show.
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// List the entity catalog.
    Entities,

    /// Print the effective configuration (tokens redacted).
    Config {
        /// Write it to the config file instead; tokens from the
        /// environment are not written.
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let config =
        MirrorConfig::load(cli.config.clone()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Sync {
            entities,
            full,
            days,
        } => {
            let options = match (full, days) {
                (true, _) => RunOptions::full(),
                (false, Some(days)) => RunOptions::lookback_days(days),
                (false, None) => RunOptions::incremental(),
            };
            sync(&config, &entities, options).await
        }
        Commands::Status { limit } => status(&config, limit).await,
        Commands::Entities => {
            list_entities(&config);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { write } => {
            show_config(config, cli.config, write)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=mirror_sync=trace` - Trace the engine only
/// - Default: INFO, DEBUG for mirror crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,mirror=debug,mirror_sync=debug,mirror_db=debug,sqlx=warn")
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_database(config: &MirrorConfig) -> Result<Database> {
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Database::new(config.db_config())
        .await
        .context("Failed to open database")
}

async fn sync(config: &MirrorConfig, names: &[String], options: RunOptions) -> Result<ExitCode> {
    let entities: Vec<EntityType> = if names.is_empty() {
        config.enabled_entities()
    } else {
        names
            .iter()
            .map(|name| config.entity(name))
            .collect::<Result<_, SyncError>>()
            .map_err(|e| {
                if e.is_config_error() {
                    anyhow!("{} (known: {})", e, catalog::names().join(", "))
                } else {
                    e.into()
                }
            })?
    };

    let db = open_database(config).await?;
    db.ensure_entity_tables(&entities).await?;

    let source = source::from_config(config).context("Failed to set up the API client")?;
    let orchestrator = SyncOrchestrator::new(db.clone(), source);

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling at the next page boundary");
            token.cancel();
        }
    });

    let reports = SyncScheduler::new(orchestrator)
        .run_all(entities, options)
        .await;

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(run) => println!("{}", run),
            Err(e) => println!("{}: {}", report.entity, e),
        }
        if report.is_failure() {
            failed += 1;
        }
    }

    db.close().await;

    if failed > 0 {
        warn!(failed, total = reports.len(), "Some runs failed");
        return Ok(ExitCode::FAILURE);
    }
    info!(total = reports.len(), "All runs finished");
    Ok(ExitCode::SUCCESS)
}

async fn status(config: &MirrorConfig, limit: u32) -> Result<ExitCode> {
    let db = open_database(config).await?;

    let (total, applied) = mirror_db::migrations::migration_status(db.pool()).await?;
    println!("Database     {}", config.database.path.display());
    println!("Migrations   {}/{} applied", applied, total);
    println!();

    println!("Checkpoints");
    let checkpoints = db.checkpoints().list().await?;
    if checkpoints.is_empty() {
        println!("  (none)");
    }
    for checkpoint in checkpoints {
        println!(
            "  {:<16} {}",
            checkpoint.entity,
            transform::format_unix(checkpoint.last_run_at)
        );
    }

    let leases = db.locks().list().await?;
    if !leases.is_empty() {
        println!();
        println!("Runs in progress");
        for lease in leases {
            println!(
                "  {:<16} since {}{}",
                lease.entity,
                transform::format_unix(lease.acquired_at),
                if lease.is_expired() { "  (expired)" } else { "" },
            );
        }
    }

    println!();
    println!("Latest runs");
    let runs = db.runs().latest(limit).await?;
    if runs.is_empty() {
        println!("  (none)");
    }
    for run in runs {
        println!(
            "  {}  {:<16} {:<11} {:<9} +{} ~{} -{}{}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.entity,
            run.mode.to_string(),
            run.status.to_string(),
            run.counts.added,
            run.counts.updated,
            run.archived,
            run.error.map(|e| format!("  {}", e)).unwrap_or_default(),
        );
    }

    db.close().await;
    Ok(ExitCode::SUCCESS)
}

fn list_entities(config: &MirrorConfig) {
    println!(
        "{:<14} {:<16} {:<14} {:<12} {:<5} {:<9} enabled",
        "entity", "table", "strategy", "changes", "full", "lookback"
    );
    for entity in catalog::all() {
        let enabled = config.entity_settings(&entity.name).enabled;
        let entity = config.resolve(entity);
        println!(
            "{:<14} {:<16} {:<14} {:<12} {:<5} {:<9} {}",
            entity.name,
            entity.table,
            entity.strategy.to_string(),
            format!("{:?}", entity.change_detection),
            if entity.supports_full { "yes" } else { "no" },
            entity
                .default_lookback_days
                .map(|d| format!("{}d", d))
                .unwrap_or_else(|| "-".into()),
            if enabled { "yes" } else { "no" },
        );
    }
}

fn show_config(mut config: MirrorConfig, path: Option<PathBuf>, write: bool) -> Result<()> {
    if write {
        let path = path
            .or_else(MirrorConfig::default_config_path)
            .context("No config path available")?;
        let file = MirrorConfig::load_file(Some(path.clone()))?;
        config.with_tokens_from(&file).save(Some(path.clone()))?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let redacted = || Some("<redacted>".to_string());
    if config.api.token.is_some() {
        config.api.token = redacted();
    }
    for settings in config.entities.values_mut() {
        if settings.token.is_some() {
            settings.token = redacted();
        }
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
