use std::sync::Arc;

use anyhow::{Context, Result};
use cast_storage::{DocumentStore, MatchStore, MemoryStore, PgStore};
use cast_sync::{
    build_scheduler, DocumentRegistry, MatchReconciler, Refresher, RuntimeConfig, Settings,
    SubmissionService, SyncStatusPoller,
};
use cast_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cast")]
#[command(about = "CSAF advisory sync tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the REST API, with the hourly refresh scheduler when enabled.
    Serve,
    /// Refresh pending documents once and exit.
    Refresh,
    /// Print the status of the configured synchronisers.
    Status,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(runtime).await,
        Commands::Refresh => refresh(runtime).await,
        Commands::Status => status(runtime).await,
        Commands::Migrate => migrate(runtime).await,
    }
}

async fn build_stores(
    runtime: &RuntimeConfig,
) -> Result<(Arc<dyn DocumentStore>, Arc<dyn MatchStore>)> {
    match &runtime.database_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url)
                    .await
                    .context("connecting to database")?,
            );
            let documents: Arc<dyn DocumentStore> = store.clone();
            let matches: Arc<dyn MatchStore> = store;
            Ok((documents, matches))
        }
        None => {
            warn!("DATABASE_URL not set; using a non-persistent in-memory store");
            let store = Arc::new(MemoryStore::new());
            let documents: Arc<dyn DocumentStore> = store.clone();
            let matches: Arc<dyn MatchStore> = store;
            Ok((documents, matches))
        }
    }
}

fn load_settings(runtime: &RuntimeConfig) -> Result<Settings> {
    Settings::load(&runtime.settings_path).with_context(|| {
        format!(
            "loading settings from {}",
            runtime.settings_path.display()
        )
    })
}

async fn serve(runtime: RuntimeConfig) -> Result<()> {
    let settings = Arc::new(load_settings(&runtime)?);
    let (documents, matches) = build_stores(&runtime).await?;

    let registry = DocumentRegistry::new(documents.clone());
    let reconciler = MatchReconciler::new(matches.clone());
    let submissions = SubmissionService::new(registry.clone(), reconciler, documents.clone());
    let poller = SyncStatusPoller::new(settings.clone(), documents.clone(), runtime.http_timeout());
    let refresher = Arc::new(
        Refresher::new(
            documents.clone(),
            settings.identity_provider.clone(),
            runtime.http_timeout(),
        )
        .context("building document refresher")?,
    );

    if let Some(scheduler) = build_scheduler(
        refresher.clone(),
        &runtime.refresh_cron,
        runtime.scheduler_enabled,
    )
    .await?
    {
        scheduler.start().await.context("starting refresh scheduler")?;
        info!(cron = %runtime.refresh_cron, "periodic document refresh scheduled");
    }

    let state = AppState {
        documents,
        matches,
        registry,
        submissions,
        poller,
        refresher: Some(refresher),
        refresh_delay: runtime.refresh_delay(),
    };
    info!(port = runtime.web_port, "serving CAST API");
    cast_web::serve(state, runtime.web_port).await
}

async fn refresh(runtime: RuntimeConfig) -> Result<()> {
    let settings = load_settings(&runtime)?;
    let (documents, _) = build_stores(&runtime).await?;
    let refresher = Refresher::new(
        documents,
        settings.identity_provider.clone(),
        runtime.http_timeout(),
    )
    .context("building document refresher")?;

    let summary = refresher.refresh_pending_documents().await?;
    println!(
        "refresh complete: run_id={} selected={} loaded={} not_found={} failed={}",
        summary.run_id, summary.selected, summary.loaded, summary.not_found, summary.failed
    );
    Ok(())
}

async fn status(runtime: RuntimeConfig) -> Result<()> {
    let settings = Arc::new(load_settings(&runtime)?);
    let (documents, _) = build_stores(&runtime).await?;
    let poller = SyncStatusPoller::new(settings, documents, runtime.http_timeout());

    for row in poller.status_rows().await {
        println!(
            "{:>2}  {:<24} {:<16} last sync: {:<24} started: {}",
            row.index, row.name, row.state, row.last_sync, row.started
        );
    }
    Ok(())
}

async fn migrate(runtime: RuntimeConfig) -> Result<()> {
    let url = runtime
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to migrate")?;
    let store = PgStore::connect(url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    println!("migrations applied");
    Ok(())
}
