//! Runs the media relay and its maintenance commands.
//!
//! Usage:
//!
//! ```text
//! mediarelayd [--config <path>] run
//! mediarelayd [--config <path>] ingest <payload.json>
//! mediarelayd [--config <path>] failed [--limit <n>]
//! mediarelayd [--config <path>] migrate
//! ```
//!
//! `run` applies the schema, settles interrupted work and processes tasks
//! until Ctrl-C. The local collaborators read from `inbox_dir`, store media
//! under `storage_dir` and publish into `outbox_dir`.

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use mediarelay::config::{DEFAULT_CONFIG_FILE, NOTIFY_TARGET, RelayConfig};
use mediarelay::task::{
    adapters::{
        fs::{FsMediaStorage, open_dir},
        local::{DirectoryDownloader, DirectoryPublisher, LogNotifier, PassthroughTransformer},
        postgres::{PostgresTaskStore, connect_pool},
        webhook::parse_payload,
    },
    domain::{DeliveryTarget, TaskStatus},
    ports::{SideEffect, TaskStore},
    services::{Collaborators, IngestService, RelayRuntime},
};
use mediarelay::telemetry::init_tracing;
use mockable::DefaultClock;
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "mediarelayd", version, about = "Crash-safe media relay")]
struct Cli {
    /// Configuration file; optional unless named explicitly.
    #[arg(long, env = "MEDIARELAY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: Utf8PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resume interrupted work and process tasks until interrupted.
    Run,
    /// Ingest the events of a webhook payload file.
    Ingest {
        /// Path to a JSON webhook body.
        file: Utf8PathBuf,
    },
    /// List terminally failed tasks.
    Failed {
        /// Maximum number of tasks to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Apply the database schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let required = cli.config.as_str() != DEFAULT_CONFIG_FILE;
    let config = RelayConfig::load(&cli.config, required)
        .wrap_err_with(|| format!("loading configuration from {}", cli.config))?;
    init_tracing(&config.log_filter, config.log_format);

    let pool = connect_pool(&config.database_url, config.pool_size)
        .wrap_err("connecting to the database")?;
    let store = Arc::new(PostgresTaskStore::new(pool));

    match cli.command {
        Command::Migrate => {
            store.migrate().await?;
            tracing::info!("schema applied");
            Ok(())
        }
        Command::Run => run(config, store).await,
        Command::Ingest { file } => ingest(store, &file).await,
        Command::Failed { limit } => list_failed(&config, store.as_ref(), limit).await,
    }
}

async fn run(config: RelayConfig, store: Arc<PostgresTaskStore>) -> Result<()> {
    store.migrate().await?;
    let settings = config.relay_settings()?;
    let collaborators = local_collaborators(&config)?;
    let mut runtime = RelayRuntime::new(
        store,
        Arc::new(DefaultClock),
        collaborators,
        settings,
    );

    let report = runtime.resume().await?;
    if report.total() > 0 || report.released_deliveries > 0 {
        tracing::info!(
            requeued = report.requeued.len(),
            posted = report.posted.len(),
            failed = report.failed.len(),
            "settled interrupted work"
        );
    }
    runtime.start()?;

    tokio::signal::ctrl_c()
        .await
        .wrap_err("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");
    if !runtime.shutdown().await {
        tracing::warn!("workers did not stop within the shutdown timeout");
    }
    Ok(())
}

fn local_collaborators(config: &RelayConfig) -> Result<Collaborators> {
    let storage = FsMediaStorage::open(&config.storage_dir)
        .wrap_err_with(|| format!("opening storage at {}", config.storage_dir))?;
    let inbox = open_dir(&config.inbox_dir)
        .wrap_err_with(|| format!("opening inbox at {}", config.inbox_dir))?;
    let outbox = open_dir(&config.outbox_dir)
        .wrap_err_with(|| format!("opening outbox at {}", config.outbox_dir))?;
    let mut side_effects: Vec<Arc<dyn SideEffect>> = Vec::new();
    if let Some(template) = &config.notify_template {
        side_effects.push(Arc::new(LogNotifier::new(
            DeliveryTarget::new(NOTIFY_TARGET)?,
            template.as_str(),
        )));
    }
    Ok(Collaborators {
        downloader: Arc::new(DirectoryDownloader::new(Arc::new(inbox))),
        transformer: Arc::new(PassthroughTransformer::new(storage.root())),
        publisher: Arc::new(DirectoryPublisher::new(storage.root(), Arc::new(outbox))),
        storage: Arc::new(storage),
        side_effects,
    })
}

async fn ingest(store: Arc<PostgresTaskStore>, file: &Utf8Path) -> Result<()> {
    let body = tokio::fs::read(file)
        .await
        .wrap_err_with(|| format!("reading {file}"))?;
    let events = parse_payload(&body)?;
    let service = IngestService::new(store, Arc::new(DefaultClock));
    let summary = service.ingest_all(events).await?;
    let mut stdout = std::io::stdout().lock();
    writeln!(
        stdout,
        "inserted {} duplicates {} rejected {}",
        summary.inserted.len(),
        summary.duplicates,
        summary.rejected
    )?;
    for task_id in &summary.inserted {
        writeln!(stdout, "{task_id}")?;
    }
    Ok(())
}

async fn list_failed(config: &RelayConfig, store: &PostgresTaskStore, limit: usize) -> Result<()> {
    let tasks = store.list_by_status(TaskStatus::Failed, limit).await?;
    let mut stdout = std::io::stdout().lock();
    for task in tasks {
        let state = if task.is_terminal(config.max_attempts) {
            "terminal"
        } else {
            "retrying"
        };
        writeln!(
            stdout,
            "{}\t{}\t{}/{}\t{state}\t{}",
            task.id(),
            task.kind(),
            task.attempts(),
            config.max_attempts,
            task.last_error().unwrap_or("-")
        )?;
    }
    Ok(())
}
