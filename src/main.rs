//! # Playlist Sync Entry Point
//!
//! Runs the dispatcher loop, triggers a single sync, or migrates legacy
//! plaintext tokens.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use playlist_sync::{
    config::ConfigLoader,
    db,
    dispatcher::Dispatcher,
    orchestrator::SyncOrchestrator,
    platforms::PlatformRegistry,
    telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "playlist-sync", version, about = "Cross-platform playlist sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the dispatcher until interrupted (default)
    Run,
    /// Sync one playlist now and wait for the result
    Trigger {
        #[arg(long)]
        playlist_id: Uuid,
    },
    /// Encrypt tokens stored before encryption was enabled
    ReencryptTokens,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, profile = %config.profile, "Loaded configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    Migrator::up(&db, None).await.context("running migrations")?;
    db::health_check(&db).await.context("database health check")?;
    let db = Arc::new(db);

    let config = Arc::new(config);
    let registry = PlatformRegistry::from_config(&config).context("building platform registry")?;
    let orchestrator = Arc::new(
        SyncOrchestrator::build(config.clone(), db, registry).context("building orchestrator")?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let dispatcher = Dispatcher::new(config, orchestrator);
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                }
                signal.cancel();
            });
            dispatcher.run(shutdown).await?;
        }
        Command::Trigger { playlist_id } => {
            let report = orchestrator
                .sync_playlist(playlist_id, CancellationToken::new())
                .await
                .with_context(|| format!("syncing playlist {}", playlist_id))?;
            info!(
                job_id = %report.job_id,
                status = %report.status,
                tracks_total = report.counts.total,
                tracks_matched = report.counts.matched,
                tracks_added = report.counts.added,
                "Sync finished"
            );
            if let Some(message) = report.error_message {
                warn!(error = %message, "Sync reported a problem");
            }
        }
        Command::ReencryptTokens => {
            let updated = orchestrator
                .connections()
                .reencrypt_legacy_tokens()
                .await
                .context("re-encrypting legacy tokens")?;
            info!(updated, "Re-encrypted legacy connection tokens");
        }
    }

    Ok(())
}
