//! Telemetry utilities for job-scoped tracing metadata and global subscriber management.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

/// Identifies the sync job a task is working for.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub job_id: Uuid,
    pub playlist_id: Uuid,
}

task_local! {
    static ACTIVE_JOB_CONTEXT: JobContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // Install log bridge first so `log::` macros (db bootstrap, sqlx) route through tracing.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. `log::` macros will not emit structured tracing events.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    Ok(())
}

/// Execute `future` within the provided job context, making it available through task-local
/// storage for the lifetime of the job.
pub async fn with_job_context<Fut, R>(context: JobContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_JOB_CONTEXT.scope(context, future).await
}

/// Get the job id of the running task, if it is executing a sync job.
pub fn current_job_id() -> Option<Uuid> {
    ACTIVE_JOB_CONTEXT.try_with(|ctx| ctx.job_id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_context_is_scoped_to_future() {
        assert!(current_job_id().is_none());

        let ctx = JobContext {
            job_id: Uuid::new_v4(),
            playlist_id: Uuid::new_v4(),
        };
        let seen = with_job_context(ctx, async { current_job_id() }).await;

        assert_eq!(seen, Some(ctx.job_id));
        assert!(current_job_id().is_none());
    }
}
