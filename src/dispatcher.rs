//! # Sync Dispatcher
//!
//! Background loop that picks up playlists whose `next_sync_at` has passed
//! and hands each one to the orchestrator on its own task. Manual triggers go
//! through the same path, so the per-playlist lock in `sync_jobs` is the only
//! admission check. Jobs abandoned by a crashed worker are failed by the
//! stale sweep, which runs at startup and on every tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, Utc};
use metrics::{counter, gauge, histogram};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::SyncError;
use crate::models::playlist::Model as PlaylistModel;
use crate::models::sync_job::Model as JobModel;
use crate::orchestrator::SyncOrchestrator;

/// Result of asking for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started { job_id: Uuid },
    /// Another job holds the playlist lock; nothing was queued
    AlreadyRunning,
}

#[derive(Debug, Clone)]
struct RunningJob {
    job_id: Uuid,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct TickStats {
    due: u64,
    started: u64,
    skipped_running: u64,
    errors: u64,
}

#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<AppConfig>,
    orchestrator: Arc<SyncOrchestrator>,
    running: Arc<Mutex<HashMap<Uuid, RunningJob>>>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(config: Arc<AppConfig>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            running: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    /// Run the dispatcher loop until the provided shutdown token fires, then
    /// cancel in-flight jobs and wait for them to finalize.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SyncError> {
        info!("Starting sync dispatcher");
        let tick_interval = TokioDuration::from_secs(self.config.dispatcher.tick_interval_seconds);

        if let Err(err) = self.sweep_stale().await {
            error!(error = %err, "Initial stale job sweep failed");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync dispatcher shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.sweep_stale().await {
                        error!(error = %err, "Stale job sweep failed");
                    }
                    if let Err(err) = self.run_due().await {
                        error!(error = %err, "Dispatcher tick failed");
                    }
                    histogram!("sync_dispatcher_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        self.cancel_all();
        self.wait_idle().await;
        info!("Sync dispatcher stopped");
        Ok(())
    }

    /// Starts a job for every due playlist, up to the batch size. Returns the
    /// number of jobs started.
    pub async fn run_due(&self) -> Result<u64, SyncError> {
        let now = Utc::now();
        let mut stats = TickStats::default();

        let due = self
            .orchestrator
            .playlists()
            .find_due(now, self.config.dispatcher.batch_size)
            .await?;
        stats.due = due.len() as u64;

        for playlist in due {
            let playlist_id = playlist.id;
            match self.start(playlist).await {
                Ok(TriggerOutcome::Started { .. }) => stats.started += 1,
                Ok(TriggerOutcome::AlreadyRunning) => stats.skipped_running += 1,
                Err(err) => {
                    stats.errors += 1;
                    error!(error = %err, playlist_id = %playlist_id, "Failed to start scheduled sync");
                }
            }
        }

        counter!("sync_dispatcher_jobs_started_total").increment(stats.started);
        gauge!("sync_jobs_running").set(self.running_count() as f64);
        debug!(
            due = stats.due,
            started = stats.started,
            skipped_running = stats.skipped_running,
            errors = stats.errors,
            "Dispatcher tick completed"
        );
        Ok(stats.started)
    }

    /// Starts a sync now, regardless of schedule.
    pub async fn trigger_sync(&self, playlist_id: Uuid) -> Result<TriggerOutcome, SyncError> {
        let playlist = self.orchestrator.playlists().require(playlist_id).await?;
        if !playlist.is_active {
            return Err(SyncError::InvalidPlaylist(format!(
                "playlist {} is inactive",
                playlist_id
            )));
        }
        self.start(playlist).await
    }

    async fn start(&self, playlist: PlaylistModel) -> Result<TriggerOutcome, SyncError> {
        let playlist_id = playlist.id;
        let job = match self.orchestrator.start_job(playlist_id).await {
            Ok((_, job)) => job,
            Err(SyncError::AlreadyRunning { .. }) => {
                debug!(playlist_id = %playlist_id, "Sync already in progress");
                return Ok(TriggerOutcome::AlreadyRunning);
            }
            Err(err) => return Err(err),
        };
        let job_id = job.id;
        self.spawn(job, playlist);
        info!(job_id = %job_id, playlist_id = %playlist_id, "Sync job started");
        Ok(TriggerOutcome::Started { job_id })
    }

    fn spawn(&self, job: JobModel, playlist: PlaylistModel) {
        let cancel = CancellationToken::new();
        let job_id = job.id;
        let playlist_id = playlist.id;
        self.lock_running().insert(
            playlist_id,
            RunningJob {
                job_id,
                cancel: cancel.clone(),
            },
        );

        let orchestrator = self.orchestrator.clone();
        let running = self.running.clone();
        self.tasks.spawn(async move {
            match orchestrator.execute(job, playlist, cancel).await {
                Ok(report) => debug!(job_id = %job_id, status = %report.status, "Sync task finished"),
                Err(err) => error!(job_id = %job_id, error = %err, "Sync task failed before finalization"),
            }
            let mut running = running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.get(&playlist_id).is_some_and(|r| r.job_id == job_id) {
                running.remove(&playlist_id);
            }
        });
    }

    /// Requests cancellation of the playlist's running job. Returns whether a
    /// job was found.
    pub fn cancel(&self, playlist_id: Uuid) -> bool {
        match self.lock_running().get(&playlist_id) {
            Some(job) => {
                info!(job_id = %job.job_id, playlist_id = %playlist_id, "Cancelling sync job");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Deactivates a playlist and cancels its in-flight job. History is kept.
    pub async fn deactivate_playlist(&self, playlist_id: Uuid) -> Result<PlaylistModel, SyncError> {
        let playlist = self.orchestrator.playlists().deactivate(playlist_id).await?;
        self.cancel(playlist_id);
        Ok(playlist)
    }

    /// Fails jobs whose last update is older than the stale timeout. Jobs
    /// running on this dispatcher are skipped.
    pub async fn sweep_stale(&self) -> Result<u64, SyncError> {
        let timeout = Duration::seconds(self.config.dispatcher.stale_job_timeout_seconds as i64);
        let live: Vec<Uuid> = self.lock_running().values().map(|job| job.job_id).collect();
        let swept = self
            .orchestrator
            .jobs()
            .sweep_stale(Utc::now() - timeout, &live)
            .await?;
        if swept > 0 {
            counter!("sync_jobs_swept_total").increment(swept);
            warn!(swept, "Failed abandoned sync jobs");
        }
        Ok(swept)
    }

    pub fn running_count(&self) -> usize {
        self.lock_running().len()
    }

    /// Waits until every spawned job task has returned.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn cancel_all(&self) {
        for job in self.lock_running().values() {
            job.cancel.cancel();
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunningJob>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
