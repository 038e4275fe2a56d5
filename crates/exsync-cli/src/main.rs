use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use exsync_storage::{PgStore, Store};
use exsync_sync::{
    install_triggers, purge_expired_logs, CronTriggers, RawCasePull, ScheduleRegistry,
    SourceApiConfig, SyncConfig, SyncScheduler, TriggerOutcome,
};
use exsync_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "exsync")]
#[command(about = "Exchange entity sync and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a sync pass now.
    Sync {
        #[command(subcommand)]
        mode: SyncMode,
    },
    /// Copy upstream matters into the cases table.
    Pull,
    /// Delete sync logs older than the retention window.
    PurgeLogs {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Apply the embedded database migrations.
    Migrate,
    /// Serve the HTTP trigger surface, plus cron triggers when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Subcommand)]
enum SyncMode {
    Full {
        #[arg(long)]
        reason: Option<String>,
    },
    Incremental {
        #[arg(long)]
        reason: Option<String>,
    },
    Case { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("exsync=info,info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let pg = PgStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;

    if let Commands::Migrate = cli.command {
        pg.migrate().await?;
        println!("migrations applied");
        return Ok(());
    }

    let store: Arc<dyn Store> = Arc::new(pg);

    match cli.command {
        Commands::Sync { mode } => {
            let scheduler = SyncScheduler::from_config(store, &config);
            let outcome = match mode {
                SyncMode::Full { reason } => scheduler.trigger_full_sync(reason.as_deref()).await,
                SyncMode::Incremental { reason } => {
                    scheduler.trigger_incremental_sync(reason.as_deref()).await
                }
                SyncMode::Case { id } => scheduler.trigger_single_case_sync(id).await,
            };
            report_outcome(outcome)?;
        }
        Commands::Pull => {
            let Some(source) = SourceApiConfig::from_env() else {
                bail!("PP_API_BASE_URL is not set");
            };
            let summary = RawCasePull::new(source.build_client()?, store).run().await?;
            println!(
                "pull complete: fetched={} inserted={} updated={} unchanged={} skipped_without_id={}",
                summary.fetched,
                summary.inserted,
                summary.updated,
                summary.unchanged,
                summary.skipped_without_id
            );
        }
        Commands::PurgeLogs { days } => {
            let days = days.unwrap_or(config.log_retention_days);
            let purged = purge_expired_logs(store.as_ref(), days).await?;
            println!("purged {purged} sync logs older than {days} days");
        }
        Commands::Serve { port } => serve(store, &config, port).await?,
        Commands::Migrate => {}
    }

    Ok(())
}

fn report_outcome(outcome: TriggerOutcome) -> Result<()> {
    match outcome {
        TriggerOutcome::Completed(agg) => {
            println!(
                "sync complete: mode={} total={} successful={} failed={} skipped={} entities_created={}",
                agg.mode.as_str(),
                agg.total,
                agg.successful,
                agg.failed,
                agg.skipped,
                agg.entities_created
            );
            for failure in &agg.failures {
                eprintln!("  case {} failed: {}", failure.case_id, failure.error);
            }
            Ok(())
        }
        TriggerOutcome::AlreadyRunning => {
            println!("sync skipped: another run is in progress");
            Ok(())
        }
        TriggerOutcome::Failed { error } => bail!("sync failed: {error}"),
    }
}

async fn serve(store: Arc<dyn Store>, config: &SyncConfig, port: Option<u16>) -> Result<()> {
    let scheduler = SyncScheduler::from_config(store.clone(), config);
    let mut state = AppState::new(scheduler.clone());

    let triggers = if config.scheduler_enabled {
        let registry = ScheduleRegistry::load(&config.schedule_file).await?;
        let pull = match SourceApiConfig::from_env() {
            Some(source) => Some(RawCasePull::new(source.build_client()?, store.clone())),
            None => None,
        };
        let triggers = Arc::new(CronTriggers::new().await?);
        let installed =
            install_triggers(&triggers, &registry, scheduler, pull, config.log_retention_days)
                .await?;
        triggers.start().await?;
        info!(installed, "cron triggers started");
        state = state.with_triggers(triggers.clone());
        Some(triggers)
    } else {
        info!("scheduler disabled; serving manual triggers only");
        None
    };

    let port = port.unwrap_or(config.web_port);
    tokio::select! {
        result = exsync_web::serve(state, port) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    if let Some(triggers) = triggers {
        if let Err(err) = triggers.shutdown().await {
            warn!(error = %err, "cron shutdown failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_has_help_text() {
        Cli::command().debug_assert();
        let cli = Cli::command();
        for sub in cli.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no about line", sub.get_name());
        }
    }
}
