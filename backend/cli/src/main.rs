use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chime_config::{load_catalog, EngineConfig};
use chime_core::types::{EventClass, RetryConf, WebhookConf};
use chime_core::Component;
use chime_scheduler::{parse_cron, Generator, LockedEvents, Processor};
use chime_store::oneoff_events::OneOffEventInsert;
use chime_store::EventStore;

#[derive(Parser)]
#[command(name = "chimed")]
#[command(about = "chime — durable scheduled-trigger webhook engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine (generator + processor loops)
    Serve,
    /// Check the trigger catalog and report problems
    Validate,
    /// Create a one-off scheduled event
    Schedule {
        /// Delivery time, RFC 3339 (e.g. 2026-08-02T18:00:00Z)
        #[arg(long)]
        at: String,
        /// Webhook URL to invoke
        #[arg(long)]
        webhook: String,
        /// JSON payload to deliver
        #[arg(long)]
        payload: Option<String>,
        /// Free-text comment stored with the event
        #[arg(long)]
        comment: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => run_engine(config).await?,
        Commands::Validate => validate_catalog(&config).await?,
        Commands::Schedule {
            at,
            webhook,
            payload,
            comment,
        } => schedule_oneoff(&config, &at, webhook, payload, comment).await?,
    }

    Ok(())
}

async fn run_engine(config: EngineConfig) -> Result<()> {
    info!(catalog = %config.catalog_path, "Starting chime engine");

    let store = EventStore::connect(&config.database_url, config.max_connections)
        .await
        .context("Failed to connect to the event store")?;

    let catalog = load_catalog(Path::new(&config.catalog_path)).await?;

    // Stale leases from a crashed instance would pin events forever; the
    // lease has no TTL, so reclaim everything before the loops start.
    let (cron, one_off) = store.unlock_all_locked_events().await?;
    if cron + one_off > 0 {
        info!(cron, one_off, "Reclaimed locked events from a previous run");
    }

    let catalog = Arc::new(RwLock::new(catalog));
    let locked = Arc::new(LockedEvents::new());
    let cancel = CancellationToken::new();

    let generator = Generator::new(store.clone(), catalog.clone());
    let processor = Processor::new(
        store.clone(),
        reqwest::Client::new(),
        catalog,
        locked.clone(),
        config.lock_batch_size,
    );

    let generator_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { generator.run(cancel).await }
    });
    let processor_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    wait_for_shutdown().await?;
    info!("Shutdown signal received; stopping loops");
    cancel.cancel();

    for (name, handle) in [("generator", generator_handle), ("processor", processor_handle)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(component = name, error = %e, "Loop exited with an error"),
            Err(e) => error!(component = name, error = %e, "Loop task panicked"),
        }
    }

    // Return this replica's in-flight leases to the queue so no work is
    // lost and no row stays pinned.
    let cron_ids = locked.snapshot(EventClass::Cron);
    let one_off_ids = locked.snapshot(EventClass::OneOff);
    let cron = store.unlock_events(&cron_ids, EventClass::Cron).await?;
    let one_off = store.unlock_events(&one_off_ids, EventClass::OneOff).await?;
    info!(cron, one_off, "Released in-flight events; shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn validate_catalog(config: &EngineConfig) -> Result<()> {
    let catalog = load_catalog(Path::new(&config.catalog_path)).await?;

    let mut problems = 0usize;
    for (name, definition) in &catalog.cron_triggers {
        if let Err(e) = parse_cron(&definition.schedule) {
            println!("trigger '{name}': {e}");
            problems += 1;
        }
    }

    if problems == 0 {
        println!(
            "catalog ok: {} trigger(s) defined",
            catalog.cron_triggers.len()
        );
        Ok(())
    } else {
        anyhow::bail!("{problems} invalid trigger(s)");
    }
}

async fn schedule_oneoff(
    config: &EngineConfig,
    at: &str,
    webhook: String,
    payload: Option<String>,
    comment: Option<String>,
) -> Result<()> {
    let scheduled_time: DateTime<Utc> = DateTime::parse_from_rfc3339(at)
        .context("--at must be an RFC 3339 timestamp")?
        .with_timezone(&Utc);
    let payload = payload
        .map(|raw| serde_json::from_str(&raw).context("--payload must be valid JSON"))
        .transpose()?;

    let store = EventStore::connect(&config.database_url, config.max_connections).await?;
    let id = store
        .insert_oneoff_event(&OneOffEventInsert {
            scheduled_time,
            webhook_conf: WebhookConf::Url(webhook),
            payload,
            retry_conf: RetryConf::default(),
            header_conf: vec![],
            comment,
        })
        .await?;

    println!("scheduled event {id} at {scheduled_time}");
    Ok(())
}
