use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mstat_report::{CsvExporter, DeltaReporter};
use mstat_storage::HttpFetcher;
use mstat_sync::{build_scheduler, open_store, Ingestor, SyncConfig, WebhookNotifier};
use mstat_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mstat-cli")]
#[command(about = "Mastodon instance statistics collector")]
struct Cli {
    /// Log filter, e.g. `info` or `mstat_sync=debug`.
    #[arg(long, global = true, default_value = "info", env = "MSTAT_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and the chat command webhook until Ctrl-C.
    Serve,
    /// Fetch the instance list once and store large instances.
    Fetch,
    /// Print the day-over-day delta table.
    Stats,
    /// Write the full history as CSV.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Create the database file and schema.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Fetch => {
            let summary = mstat_sync::run_ingest_once_from_env().await?;
            println!(
                "fetch complete: run_id={} fetched={} stored={}",
                summary.run_id, summary.fetched_count, summary.stored_count
            );
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            let table = DeltaReporter::new(store.clone()).render().await;
            store.close().await;
            print!("{}", table?);
        }
        Commands::Export { out } => {
            let store = open_store(&config).await?;
            let csv = CsvExporter::new(store.clone(), config.timezone).render_csv().await;
            store.close().await;
            let csv = csv?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, csv)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => print!("{csv}"),
            }
        }
        Commands::InitDb => {
            let store = open_store(&config).await?;
            let rows = store.count().await?;
            store.close().await;
            println!("database ready: {} ({rows} snapshots)", config.database_path.display());
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let ingestor = Arc::new(Ingestor::from_config(&config, store.clone(), http.clone()));
    let notifier = WebhookNotifier::from_config(&config, http).map(Arc::new);
    if notifier.is_none() {
        warn!("MSTAT_CHAT_WEBHOOK_URL not set; failed scheduled runs are only logged");
    }

    let mut scheduler = build_scheduler(&config, ingestor.clone(), notifier).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let state = AppState::new(&config, store.clone(), ingestor);
    let served = mstat_web::serve(state, config.web_port, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    info!("shutting down");
    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    store.close().await;
    served
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}
