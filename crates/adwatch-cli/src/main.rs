//! `adwatch` binary: the long-running watcher, single-cycle maintenance
//! commands, and the JSON API server.

use std::path::PathBuf;

use adwatch_sched::{
    shutdown_channel, AcquisitionScheduler, AppConfig, EnrichmentScheduler, Reaper,
};
use adwatch_source::SourceClient;
use adwatch_store::ListingStore;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adwatch", version, about = "Marketplace listing watcher")]
struct Cli {
    /// YAML config file; falls back to ADWATCH_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run acquisition, enrichment, and the reaper until ctrl-c.
    Watch,
    /// Run one acquisition cycle and exit.
    Acquire,
    /// Run one enrichment batch and exit.
    Enrich,
    /// Run one retention sweep and exit.
    Reap,
    /// Serve the JSON listing API.
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_yaml_file(path)?,
        None => AppConfig::from_env()?,
    };

    let store = ListingStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;

    match cli.command {
        Command::Watch => watch(config, store).await,
        Command::Acquire => {
            let client = SourceClient::new(config.source_config())?;
            let stats = AcquisitionScheduler::new(client, store, &config)
                .cycle()
                .await?;
            info!(
                inserted = stats.inserted,
                duplicates = stats.duplicates,
                rejected = stats.rejected(),
                failed_pages = stats.failed_pages,
                "acquisition cycle finished"
            );
            Ok(())
        }
        Command::Enrich => {
            let client = SourceClient::new(config.source_config())?;
            let (_handle, mut shutdown) = shutdown_channel();
            let stats = EnrichmentScheduler::new(client, store, &config)
                .cycle(&mut shutdown)
                .await?;
            info!(
                tier = ?stats.tier,
                selected = stats.selected,
                updated = stats.updated,
                deleted = stats.deleted,
                deferred = stats.deferred,
                "enrichment batch finished"
            );
            Ok(())
        }
        Command::Reap => {
            let removed = Reaper::new(store, &config).cycle().await?;
            info!(removed, "retention sweep finished");
            Ok(())
        }
        Command::Serve { port } => serve(config, store, port).await,
    }
}

/// All three loops share the store pool and one shutdown signal; ctrl-c lets
/// each loop finish its in-flight item before exiting.
async fn watch(config: AppConfig, store: ListingStore) -> anyhow::Result<()> {
    let (handle, shutdown) = shutdown_channel();

    let acquisition = AcquisitionScheduler::new(
        SourceClient::new(config.source_config())?,
        store.clone(),
        &config,
    );
    let enrichment = EnrichmentScheduler::new(
        SourceClient::new(config.source_config())?,
        store.clone(),
        &config,
    );
    let reaper = Reaper::new(store, &config);

    let acquisition = tokio::spawn(acquisition.run(shutdown.clone()));
    let enrichment = tokio::spawn(enrichment.run(shutdown.clone()));
    let reaper = tokio::spawn(reaper.run(shutdown));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested, letting loops drain");
    handle.trigger();

    let _ = tokio::join!(acquisition, enrichment, reaper);
    info!("all loops stopped");
    Ok(())
}

async fn serve(config: AppConfig, store: ListingStore, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let app = adwatch_web::router(store);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving listing api");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("api server failed")
}
