use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hsync_sync::{build_orchestrator, RunOutcome, SyncConfig, SyncScheduler};
use hsync_web::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hsync")]
#[command(about = "Wearable telemetry sync scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the cron scheduler and the HTTP front door (default)
    Serve,
    /// Run a single manual sync and exit
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Sync => {
            let outcome = hsync_sync::run_sync_once_from_env().await?;
            match outcome {
                RunOutcome::Completed(summary) => println!(
                    "sync complete: run_id={} status={:?} attempts={} failed={} fetched={} inserted={} updated={}",
                    summary.run_id,
                    summary.status,
                    summary.attempts,
                    summary.failed_attempts,
                    summary.records_fetched,
                    summary.records_inserted,
                    summary.records_updated
                ),
                RunOutcome::Aborted(reason) => println!("sync aborted: {reason}"),
                RunOutcome::Skipped => println!("sync skipped: another run is in progress"),
            }
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let orchestrator = build_orchestrator(&config)?;
    info!(
        ingestion_url = %config.ingestion_service_url,
        schedule = %config.schedule_label(),
        timezone = %config.timezone,
        "starting sync scheduler service"
    );

    let scheduler = if config.scheduler_enabled {
        Some(
            SyncScheduler::start(orchestrator.clone(), &config.cron_expression(), config.shutdown_grace())
                .await?,
        )
    } else {
        warn!("scheduler disabled; only manual triggers will run");
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    let state = AppState::new(orchestrator, &config);
    let report = hsync_web::serve_until(
        listener,
        state,
        scheduler,
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        },
        config.shutdown_grace(),
    )
    .await?;

    if !report.http_drained || !report.sync_drained {
        warn!(
            http_drained = report.http_drained,
            sync_drained = report.sync_drained,
            "shutdown grace period elapsed with work still in flight"
        );
    }
    info!("sync scheduler service stopped");
    Ok(())
}
