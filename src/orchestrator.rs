//! # Sync Job Orchestrator
//!
//! Drives one playlist sync from lock acquisition to finalization:
//!
//! 1. insert a `pending` job (the per-playlist lock) and move it to `running`
//! 2. preflight the playlist, both connections and adapter capabilities
//! 3. fetch the source snapshot and resolve the destination playlist
//! 4. match and write every track through an ordered, bounded pipeline,
//!    appending one SyncLog per track as soon as its outcome is known
//! 5. remove extraneous destination tracks in mirror mode
//! 6. finalize the job and advance the playlist schedule in one transaction
//!
//! Provider calls that fail with an auth error are retried once after a
//! token refresh. A second auth failure, or a refresh that cannot succeed,
//! expires the connection and fails the job. While the job runs it bumps
//! its `updated_at` so the stale sweep can tell it from an abandoned one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use rand::Rng;
use sea_orm::DatabaseConnection;
use serde_json::{Value as JsonValue, json};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, DispatcherConfig};
use crate::crypto::TokenVault;
use crate::error::SyncError;
use crate::matcher::{MatchResult, TrackMatcher};
use crate::models::connection::{ConnectionStatus, Model as ConnectionModel};
use crate::models::playlist::{Model as PlaylistModel, SyncFrequency, SyncMode};
use crate::models::sync_job::{JobStatus, Model as JobModel};
use crate::models::sync_log::TrackStatus;
use crate::platforms::{
    AccessContext, NormalizedTrack, PlatformAdapter, PlatformCapabilities, PlatformError,
    PlatformRegistry,
};
use crate::repositories::{
    ConnectionRepository, JobCompletion, JobCounts, NewSyncLog, PlaylistRepository,
    SyncJobRepository, SyncLogRepository,
};
use crate::telemetry::{JobContext, with_job_context};
use crate::token_refresh::TokenRefresher;

const CANCELLED_DETAIL: &str = "cancelled before processing";

/// Summary returned once a job reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub job_id: Uuid,
    pub playlist_id: Uuid,
    pub status: JobStatus,
    pub counts: JobCounts,
    pub error_message: Option<String>,
}

/// Next run time for a recurring playlist: the frequency interval after
/// `completed_at`, stretched by a random jitter fraction of the interval.
pub fn next_sync_at<R: Rng + ?Sized>(
    frequency: SyncFrequency,
    completed_at: DateTime<Utc>,
    config: &DispatcherConfig,
    rng: &mut R,
) -> Option<DateTime<Utc>> {
    let interval = frequency.interval()?;
    let min = config.jitter_pct_min.max(0.0);
    let max = config.jitter_pct_max.max(min);
    let jitter_pct = if (max - min).abs() < f64::EPSILON {
        min
    } else {
        rng.gen_range(min..=max)
    };
    let jitter_seconds = (interval.num_seconds() as f64 * jitter_pct).round() as i64;
    Some(completed_at + interval + Duration::seconds(jitter_seconds))
}

/// How often a running job refreshes `updated_at`: a quarter of the stale
/// timeout.
fn heartbeat_interval(config: &DispatcherConfig) -> std::time::Duration {
    let millis = config.stale_job_timeout_seconds.saturating_mul(1_000) / 4;
    std::time::Duration::from_millis(millis.max(100))
}

/// Credentials of one connection for the duration of a job. Shared by the
/// concurrent track pipeline so a refresh is visible to every task.
struct AuthSession {
    connection_id: Uuid,
    ctx: RwLock<AccessContext>,
}

impl AuthSession {
    fn new(connection_id: Uuid, ctx: AccessContext) -> Self {
        Self {
            connection_id,
            ctx: RwLock::new(ctx),
        }
    }
}

/// Failure of a provider call after the auth recovery step.
#[derive(Debug)]
enum CallError {
    /// Recorded per track or mapped to a job failure by the caller
    Platform(PlatformError),
    /// Refresh could not restore access; the job must fail
    AuthExpired { connection_id: Uuid, message: String },
    Fatal(SyncError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Platform(err) => write!(f, "{}", err),
            CallError::AuthExpired {
                connection_id,
                message,
            } => write!(
                f,
                "connection {} expired after failed token refresh: {}",
                connection_id, message
            ),
            CallError::Fatal(err) => write!(f, "{}", err),
        }
    }
}

/// Job-level events stored in `sync_jobs.logs`.
#[derive(Debug, Default)]
struct JobEvents(Vec<JsonValue>);

impl JobEvents {
    fn push(&mut self, event: &str, details: JsonValue) {
        self.0.push(json!({
            "event": event,
            "at": Utc::now().to_rfc3339(),
            "details": details,
        }));
    }

    fn into_json(self) -> JsonValue {
        JsonValue::Array(self.0)
    }
}

/// Destination tracks already present before this run.
#[derive(Debug, Default)]
struct DestinationIndex {
    tracks: Vec<NormalizedTrack>,
    ids: HashSet<String>,
    by_isrc: HashMap<String, NormalizedTrack>,
}

impl DestinationIndex {
    fn new(tracks: Vec<NormalizedTrack>) -> Self {
        let ids = tracks.iter().map(|t| t.provider_track_id.clone()).collect();
        let by_isrc = tracks
            .iter()
            .filter_map(|t| {
                t.isrc
                    .as_deref()
                    .map(isrc_key)
                    .filter(|k| !k.is_empty())
                    .map(|k| (k, t.clone()))
            })
            .collect();
        Self {
            tracks,
            ids,
            by_isrc,
        }
    }

    fn contains(&self, candidate: &NormalizedTrack) -> bool {
        self.ids.contains(&candidate.provider_track_id)
            || candidate
                .isrc
                .as_deref()
                .is_some_and(|isrc| self.by_isrc.contains_key(&isrc_key(isrc)))
    }

    fn by_source_isrc(&self, source: &NormalizedTrack) -> Option<&NormalizedTrack> {
        source
            .isrc
            .as_deref()
            .and_then(|isrc| self.by_isrc.get(&isrc_key(isrc)))
    }
}

fn isrc_key(isrc: &str) -> String {
    isrc.trim().to_ascii_uppercase()
}

/// Everything the per-track pipeline needs, borrowed for the run.
struct TrackPipeline<'a> {
    mode: SyncMode,
    destination: &'a dyn PlatformAdapter,
    session: &'a AuthSession,
    destination_playlist_id: Option<&'a str>,
    existing: &'a DestinationIndex,
    /// One write per destination id within a run
    writes: Mutex<HashMap<String, Arc<OnceCell<Result<(), String>>>>>,
    cancel: &'a CancellationToken,
}

/// Per-track result: the log row plus what it contributed.
struct TrackOutcome {
    log: NewSyncLog,
    dest_track_id: Option<String>,
    /// The destination search failed, so the match is unknown
    search_failed: bool,
}

/// The run was cut short by a job-level failure.
struct JobFailure {
    message: String,
    counts: JobCounts,
}

impl JobFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            counts: JobCounts::default(),
        }
    }
}

struct RunSummary {
    status: JobStatus,
    counts: JobCounts,
    error_message: Option<String>,
}

pub struct SyncOrchestrator {
    config: Arc<AppConfig>,
    registry: PlatformRegistry,
    connections: ConnectionRepository,
    playlists: PlaylistRepository,
    jobs: SyncJobRepository,
    logs: SyncLogRepository,
    refresher: TokenRefresher,
    matcher: TrackMatcher,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        registry: PlatformRegistry,
        connections: ConnectionRepository,
        playlists: PlaylistRepository,
        jobs: SyncJobRepository,
        logs: SyncLogRepository,
        refresher: TokenRefresher,
    ) -> Self {
        let matcher = TrackMatcher::new(config.matcher.clone());
        Self {
            config,
            registry,
            connections,
            playlists,
            jobs,
            logs,
            refresher,
            matcher,
        }
    }

    /// Wires repositories, the token vault and the refresher around a
    /// shared pool.
    pub fn build(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        registry: PlatformRegistry,
    ) -> Result<Self, SyncError> {
        let vault = TokenVault::from_bytes(config.crypto_key.as_deref().unwrap_or_default())?;
        let connections = ConnectionRepository::new(db.clone(), vault);
        let refresher = TokenRefresher::new(
            connections.clone(),
            registry.clone(),
            &config.token_refresh,
        );
        Ok(Self::new(
            config,
            registry,
            connections,
            PlaylistRepository::new(db.clone()),
            SyncJobRepository::new(db.clone()),
            SyncLogRepository::new(db),
            refresher,
        ))
    }

    pub fn connections(&self) -> &ConnectionRepository {
        &self.connections
    }

    pub fn logs(&self) -> &SyncLogRepository {
        &self.logs
    }

    pub fn playlists(&self) -> &PlaylistRepository {
        &self.playlists
    }

    pub fn jobs(&self) -> &SyncJobRepository {
        &self.jobs
    }

    /// Takes the playlist lock. Fails with `AlreadyRunning` when another
    /// job is pending or running for the playlist.
    pub async fn start_job(&self, playlist_id: Uuid) -> Result<(PlaylistModel, JobModel), SyncError> {
        let playlist = self.playlists.require(playlist_id).await?;
        let mode = playlist.mode()?;
        let job = self
            .jobs
            .insert_pending(playlist.id, mode, Utc::now())
            .await?;
        Ok((playlist, job))
    }

    /// Starts and runs a job to completion.
    pub async fn sync_playlist(
        &self,
        playlist_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let (playlist, job) = self.start_job(playlist_id).await?;
        self.execute(job, playlist, cancel).await
    }

    /// Runs a job previously returned by [`SyncOrchestrator::start_job`].
    pub async fn execute(
        &self,
        job: JobModel,
        playlist: PlaylistModel,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let context = JobContext {
            job_id: job.id,
            playlist_id: playlist.id,
        };
        with_job_context(context, self.execute_in_context(job, playlist, cancel)).await
    }

    #[instrument(skip_all, fields(job_id = %job.id, playlist_id = %playlist.id))]
    async fn execute_in_context(
        &self,
        job: JobModel,
        playlist: PlaylistModel,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        self.jobs.mark_running(job.id, Utc::now()).await?;
        info!("Sync job running");

        let mut events = JobEvents::default();
        let outcome = {
            let run = self.run(&job, &playlist, &cancel, &mut events);
            tokio::pin!(run);
            let mut heartbeat = tokio::time::interval(heartbeat_interval(&self.config.dispatcher));
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    _ = heartbeat.tick() => {
                        match self.jobs.heartbeat(job.id, Utc::now()).await {
                            Ok(true) => {}
                            Ok(false) => warn!("Job no longer active while running"),
                            Err(err) => warn!(error = %err, "Failed to record job heartbeat"),
                        }
                    }
                }
            }
        };
        let finished_at = Utc::now();

        let (completion, report) = match outcome {
            Ok(summary) => {
                let next = playlist.frequency().ok().and_then(|frequency| {
                    next_sync_at(
                        frequency,
                        finished_at,
                        &self.config.dispatcher,
                        &mut rand::thread_rng(),
                    )
                });
                let report = SyncReport {
                    job_id: job.id,
                    playlist_id: playlist.id,
                    status: summary.status,
                    counts: summary.counts,
                    error_message: summary.error_message.clone(),
                };
                let completion = JobCompletion {
                    status: summary.status,
                    counts: summary.counts,
                    error_message: summary.error_message,
                    logs: events.into_json(),
                    schedule: Some((playlist.id, next)),
                };
                (completion, report)
            }
            Err(failure) => {
                error!(error = %failure.message, "Sync job failed");
                let report = SyncReport {
                    job_id: job.id,
                    playlist_id: playlist.id,
                    status: JobStatus::Failed,
                    counts: failure.counts,
                    error_message: Some(failure.message.clone()),
                };
                let completion = JobCompletion {
                    status: JobStatus::Failed,
                    counts: failure.counts,
                    error_message: Some(failure.message),
                    logs: events.into_json(),
                    schedule: None,
                };
                (completion, report)
            }
        };

        let finalized = self.jobs.finalize(job.id, completion, finished_at).await?;

        let status_label = vec![("status", report.status.to_string())];
        counter!("sync_jobs_total", &status_label).increment(1);
        histogram!("sync_job_duration_seconds").record(started.elapsed().as_secs_f64());

        info!(
            status = %report.status,
            finalized,
            tracks_total = report.counts.total,
            tracks_matched = report.counts.matched,
            tracks_added = report.counts.added,
            duration_ms = started.elapsed().as_millis() as u64,
            "Sync job finished"
        );
        Ok(report)
    }

    async fn run(
        &self,
        job: &JobModel,
        playlist: &PlaylistModel,
        cancel: &CancellationToken,
        events: &mut JobEvents,
    ) -> Result<RunSummary, JobFailure> {
        // Preflight
        if !playlist.is_active {
            return Err(JobFailure::new("playlist is inactive"));
        }
        let mode: SyncMode = job
            .sync_mode
            .parse()
            .map_err(|e: crate::models::ParseEnumError| JobFailure::new(e.to_string()))?;

        let source_conn = self
            .usable_connection(playlist.source_connection_id, "source")
            .await?;
        let dest_conn = self
            .usable_connection(playlist.destination_connection_id, "destination")
            .await?;
        let source_adapter = self.adapter_for(&source_conn)?;
        let dest_adapter = self.adapter_for(&dest_conn)?;
        let dest_caps = dest_adapter.capabilities();
        check_capabilities(mode, &source_conn, &source_adapter.capabilities(), &dest_conn, &dest_caps)?;

        let source_session = self.session_for(&source_conn).await?;
        let dest_session = self.session_for(&dest_conn).await?;

        // Source snapshot
        let source_id = playlist.source_playlist_id.as_str();
        let source_ref = source_adapter.as_ref();
        let tracks = self
            .call(&source_session, move |ctx| async move {
                source_ref.fetch_playlist_tracks(&ctx, source_id).await
            })
            .await
            .map_err(|err| JobFailure::new(format!("failed to fetch source playlist: {}", err)))?;
        debug!(count = tracks.len(), "Fetched source tracks");

        let now = Utc::now();
        for connection_id in [source_conn.id, dest_conn.id] {
            if let Err(err) = self.connections.touch_last_used(connection_id, now).await {
                warn!(connection_id = %connection_id, error = %err, "Failed to record connection use");
            }
        }

        // Destination
        let (destination_playlist_id, existing) = if mode.writes() {
            let (id, existing) = self
                .resolve_destination(playlist, dest_adapter.as_ref(), &dest_session, events)
                .await?;
            (Some(id), existing)
        } else {
            (None, DestinationIndex::default())
        };

        // Tracks
        let pipeline = TrackPipeline {
            mode,
            destination: dest_adapter.as_ref(),
            session: &dest_session,
            destination_playlist_id: destination_playlist_id.as_deref(),
            existing: &existing,
            writes: Mutex::new(HashMap::new()),
            cancel,
        };

        let total = tracks.len();
        let mut counts = JobCounts {
            total: to_i32(total),
            ..JobCounts::default()
        };
        let mut matched_dest_ids: HashSet<String> = HashSet::new();
        let mut search_failures = 0usize;
        let mut fatal: Option<CallError> = None;

        {
            let concurrency = self.config.orchestrator.write_concurrency.max(1);
            let mut outcomes = std::pin::pin!(
                stream::iter(tracks.iter().enumerate())
                    .map(|(position, track)| self.process_track(&pipeline, position, track))
                    .buffered(concurrency)
                    .boxed()
            );

            while let Some(result) = outcomes.next().await {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                };

                let status = outcome.log.status;
                if status.is_success() {
                    counts.matched += 1;
                }
                if status == TrackStatus::Written {
                    counts.added += 1;
                }
                if let Some(id) = outcome.dest_track_id {
                    matched_dest_ids.insert(id);
                }
                if outcome.search_failed {
                    search_failures += 1;
                }
                let track_label = vec![("status", status.to_string())];
                counter!("sync_tracks_total", &track_label).increment(1);

                if let Err(err) = self.logs.append(job.id, outcome.log).await {
                    let mut failure = JobFailure::new(format!("failed to persist sync log: {}", err));
                    counts.unmatched = counts.total - counts.matched;
                    failure.counts = counts;
                    return Err(failure);
                }
            }
        }
        counts.unmatched = counts.total - counts.matched;

        if let Some(err) = fatal {
            return Err(JobFailure {
                message: err.to_string(),
                counts,
            });
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("Sync job cancelled");
            events.push("cancelled", json!({ "tracks_processed": counts.matched }));
        }

        // Mirror removals
        let mut removal_failed = false;
        if mode == SyncMode::Mirror {
            if cancelled {
                events.push("removal_skipped", json!({ "reason": "cancelled" }));
            } else if search_failures > 0 {
                // an unanswered search may hide a destination copy of a source track
                warn!(search_failures, "Skipping mirror removal after failed searches");
                events.push(
                    "removal_skipped",
                    json!({ "reason": "incomplete match", "search_failures": search_failures }),
                );
            } else if !dest_caps.can_remove {
                events.push(
                    "removal_skipped",
                    json!({ "reason": "destination cannot remove tracks" }),
                );
            } else if let Some(dest_id) = destination_playlist_id.as_deref() {
                let source_isrcs: HashSet<String> = tracks
                    .iter()
                    .filter_map(|t| t.isrc.as_deref().map(isrc_key))
                    .collect();
                let extraneous: Vec<String> = existing
                    .tracks
                    .iter()
                    .filter(|t| !matched_dest_ids.contains(&t.provider_track_id))
                    .filter(|t| {
                        !t.isrc
                            .as_deref()
                            .is_some_and(|isrc| source_isrcs.contains(&isrc_key(isrc)))
                    })
                    .map(|t| t.provider_track_id.clone())
                    .collect();

                if !extraneous.is_empty() {
                    let adapter = dest_adapter.as_ref();
                    let ids = extraneous.as_slice();
                    match self
                        .call(&dest_session, move |ctx| async move {
                            adapter.remove_tracks(&ctx, dest_id, ids).await
                        })
                        .await
                    {
                        Ok(()) => {
                            info!(removed = extraneous.len(), "Removed extraneous destination tracks");
                            events.push("tracks_removed", json!({ "count": extraneous.len() }));
                        }
                        Err(CallError::Platform(err)) => {
                            removal_failed = true;
                            warn!(error = %err, "Mirror removal failed");
                            events.push(
                                "removal_failed",
                                json!({ "count": extraneous.len(), "error": err.to_string() }),
                            );
                        }
                        Err(err) => {
                            return Err(JobFailure {
                                message: err.to_string(),
                                counts,
                            });
                        }
                    }
                }
            }
        }

        let status = if counts.unmatched == 0 && !removal_failed && !cancelled {
            JobStatus::Completed
        } else {
            JobStatus::Partial
        };
        let error_message = if cancelled {
            Some("cancelled".to_string())
        } else if removal_failed {
            Some("failed to remove extraneous destination tracks".to_string())
        } else {
            None
        };

        Ok(RunSummary {
            status,
            counts,
            error_message,
        })
    }

    async fn usable_connection(&self, id: Uuid, role: &str) -> Result<ConnectionModel, JobFailure> {
        let connection = self
            .connections
            .get(id)
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?
            .ok_or_else(|| JobFailure::new(format!("{} connection {} not found", role, id)))?;
        let status = connection
            .connection_status()
            .map_err(|e| JobFailure::new(e.to_string()))?;
        if status == ConnectionStatus::Expired {
            return Err(JobFailure::new(format!(
                "{} connection {} is expired",
                role, id
            )));
        }
        Ok(connection)
    }

    fn adapter_for(&self, connection: &ConnectionModel) -> Result<Arc<dyn PlatformAdapter>, JobFailure> {
        let provider = connection
            .provider()
            .map_err(|e| JobFailure::new(e.to_string()))?;
        self.registry
            .get(provider)
            .map_err(|e| JobFailure::new(e.to_string()))
    }

    async fn session_for(&self, connection: &ConnectionModel) -> Result<AuthSession, JobFailure> {
        match self.refresher.access_for(connection).await {
            Ok(ctx) => Ok(AuthSession::new(connection.id, ctx)),
            Err(err) => Err(JobFailure::new(format!(
                "credentials for connection {} unavailable: {}",
                connection.id, err
            ))),
        }
    }

    /// Creates the destination playlist when missing or gone, then indexes
    /// the tracks it already holds.
    async fn resolve_destination(
        &self,
        playlist: &PlaylistModel,
        adapter: &dyn PlatformAdapter,
        session: &AuthSession,
        events: &mut JobEvents,
    ) -> Result<(String, DestinationIndex), JobFailure> {
        let dest_id = match playlist.destination_playlist_id.clone() {
            Some(id) => id,
            None => {
                let id = self.create_destination(playlist, adapter, session).await?;
                events.push("destination_created", json!({ "playlist_id": id }));
                id
            }
        };

        let lookup_id = dest_id.as_str();
        let existing = self
            .call(session, move |ctx| async move {
                adapter.fetch_playlist_tracks(&ctx, lookup_id).await
            })
            .await;

        match existing {
            Ok(tracks) => Ok((dest_id, DestinationIndex::new(tracks))),
            Err(CallError::Platform(PlatformError::NotFound { .. })) => {
                warn!(destination_playlist_id = %dest_id, "Destination playlist gone; recreating");
                let id = self.create_destination(playlist, adapter, session).await?;
                events.push(
                    "destination_recreated",
                    json!({ "previous_playlist_id": dest_id, "playlist_id": id }),
                );
                Ok((id, DestinationIndex::default()))
            }
            Err(err) => Err(JobFailure::new(format!(
                "failed to read destination playlist: {}",
                err
            ))),
        }
    }

    async fn create_destination(
        &self,
        playlist: &PlaylistModel,
        adapter: &dyn PlatformAdapter,
        session: &AuthSession,
    ) -> Result<String, JobFailure> {
        let title = playlist.name.as_str();
        let description = self.config.orchestrator.playlist_description.as_str();
        let id = self
            .call(session, move |ctx| async move {
                adapter.create_playlist(&ctx, title, description).await
            })
            .await
            .map_err(|err| JobFailure::new(format!("failed to create destination playlist: {}", err)))?;

        self.playlists
            .set_destination_playlist_id(playlist.id, &id)
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?;
        info!(destination_playlist_id = %id, "Created destination playlist");
        Ok(id)
    }

    /// Matches one track and writes it when needed. Only job-level failures
    /// are returned as errors; everything else becomes the track's log.
    async fn process_track(
        &self,
        pipeline: &TrackPipeline<'_>,
        position: usize,
        source: &NormalizedTrack,
    ) -> Result<TrackOutcome, CallError> {
        let base = NewSyncLog {
            position: to_i32(position),
            source_track_id: source.provider_track_id.clone(),
            source_title: source.title.clone(),
            source_artist: source.artist.clone(),
            dest_track_id: None,
            dest_title: None,
            dest_artist: None,
            confidence_score: 0.0,
            status: TrackStatus::Unmatched,
            error_details: None,
        };

        if pipeline.cancel.is_cancelled() {
            return Ok(TrackOutcome {
                log: NewSyncLog {
                    error_details: Some(CANCELLED_DETAIL.to_string()),
                    ..base
                },
                dest_track_id: None,
                search_failed: false,
            });
        }

        // Already on the destination under the same ISRC
        if pipeline.mode.writes() {
            if let Some(present) = pipeline.existing.by_source_isrc(source) {
                return Ok(matched_outcome(base, present, 1.0, TrackStatus::Matched, None));
            }
        }

        let matcher = &self.matcher;
        let adapter = pipeline.destination;
        let result: MatchResult = match self
            .call(pipeline.session, move |ctx| async move {
                matcher.match_track(source, adapter, &ctx).await
            })
            .await
        {
            Ok(result) => result,
            Err(CallError::Platform(err)) => {
                warn!(position, error = %err, "Track search failed");
                return Ok(TrackOutcome {
                    log: NewSyncLog {
                        error_details: Some(format!("search failed ({}): {}", err.kind(), err)),
                        ..base
                    },
                    dest_track_id: None,
                    search_failed: true,
                });
            }
            Err(err) => return Err(err),
        };

        let confidence = result.confidence;
        let Some(candidate) = result.candidate else {
            return Ok(TrackOutcome {
                log: NewSyncLog {
                    confidence_score: confidence,
                    ..base
                },
                dest_track_id: None,
                search_failed: false,
            });
        };

        if !pipeline.mode.writes() || pipeline.existing.contains(&candidate) {
            return Ok(matched_outcome(base, &candidate, confidence, TrackStatus::Matched, None));
        }

        let Some(playlist_id) = pipeline.destination_playlist_id else {
            return Ok(matched_outcome(base, &candidate, confidence, TrackStatus::Matched, None));
        };

        let cell = {
            let mut writes = pipeline.writes.lock().await;
            writes
                .entry(candidate.provider_track_id.clone())
                .or_default()
                .clone()
        };

        let mut wrote = false;
        let write_result = cell
            .get_or_init(|| async {
                wrote = true;
                let ids = vec![candidate.provider_track_id.clone()];
                let ids = ids.as_slice();
                match self
                    .call(pipeline.session, move |ctx| async move {
                        adapter.add_tracks(&ctx, playlist_id, ids).await
                    })
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(err) => Err(err.to_string()),
                }
            })
            .await
            .clone();

        let outcome = match (write_result, wrote) {
            (Ok(()), true) => matched_outcome(base, &candidate, confidence, TrackStatus::Written, None),
            // a duplicate of a track written earlier in this run
            (Ok(()), false) => matched_outcome(base, &candidate, confidence, TrackStatus::Matched, None),
            (Err(message), _) => {
                warn!(position, error = %message, "Track write failed");
                matched_outcome(
                    base,
                    &candidate,
                    confidence,
                    TrackStatus::WriteFailed,
                    Some(format!("write failed: {}", message)),
                )
            }
        };
        Ok(outcome)
    }

    /// Runs a provider call, refreshing the session's token and retrying
    /// once when the provider rejects it.
    async fn call<T, F, Fut>(&self, session: &AuthSession, call: F) -> Result<T, CallError>
    where
        F: Fn(AccessContext) -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let ctx = session.ctx.read().await.clone();
        let rejected = match call(ctx.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_auth() => err,
            Err(err) => return Err(CallError::Platform(err)),
        };

        warn!(
            connection_id = %session.connection_id,
            error = %rejected,
            "Provider rejected token; refreshing"
        );
        let fresh = match self
            .refresher
            .refresh(session.connection_id, &ctx.access_token)
            .await
        {
            Ok(fresh) => fresh,
            Err(SyncError::Platform(err)) if err.is_auth() => {
                self.connections
                    .mark_expired(session.connection_id)
                    .await
                    .map_err(CallError::Fatal)?;
                return Err(CallError::AuthExpired {
                    connection_id: session.connection_id,
                    message: err.to_string(),
                });
            }
            Err(SyncError::ConnectionExpired { connection_id }) => {
                return Err(CallError::AuthExpired {
                    connection_id,
                    message: rejected.to_string(),
                });
            }
            Err(err) => return Err(CallError::Fatal(err)),
        };
        *session.ctx.write().await = fresh.clone();

        match call(fresh).await {
            Err(err) if err.is_auth() => {
                self.connections
                    .mark_expired(session.connection_id)
                    .await
                    .map_err(CallError::Fatal)?;
                Err(CallError::AuthExpired {
                    connection_id: session.connection_id,
                    message: err.to_string(),
                })
            }
            other => other.map_err(CallError::Platform),
        }
    }
}

fn check_capabilities(
    mode: SyncMode,
    source: &ConnectionModel,
    source_caps: &PlatformCapabilities,
    destination: &ConnectionModel,
    dest_caps: &PlatformCapabilities,
) -> Result<(), JobFailure> {
    if !(source.can_read && source_caps.can_read) {
        return Err(JobFailure::new(format!(
            "source {} cannot read playlists",
            source.provider
        )));
    }
    if mode.writes() && !(destination.can_write && dest_caps.can_write) {
        return Err(JobFailure::new(format!(
            "{} does not support writing playlists",
            destination.provider
        )));
    }
    Ok(())
}

fn matched_outcome(
    base: NewSyncLog,
    candidate: &NormalizedTrack,
    confidence: f64,
    status: TrackStatus,
    error_details: Option<String>,
) -> TrackOutcome {
    TrackOutcome {
        dest_track_id: Some(candidate.provider_track_id.clone()),
        search_failed: false,
        log: NewSyncLog {
            dest_track_id: Some(candidate.provider_track_id.clone()),
            dest_title: Some(candidate.title.clone()),
            dest_artist: Some(candidate.artist.clone()),
            confidence_score: confidence,
            status,
            error_details,
            ..base
        },
    }
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
