//! Dispatcher scheduling, manual triggers and the stale job sweep.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use playlist_sync::dispatcher::{Dispatcher, TriggerOutcome};
use playlist_sync::error::SyncError;
use playlist_sync::models::connection::Provider;
use playlist_sync::models::playlist::{SyncFrequency, SyncMode};
use playlist_sync::models::sync_job::JobStatus;
use playlist_sync::repositories::{JobCompletion, JobCounts};
use serde_json::json;
use tokio::sync::Semaphore;

use test_utils::{FakePlatform, Harness, test_config, track};

fn dispatcher(h: &Harness) -> Dispatcher {
    Dispatcher::new(h.config.clone(), h.orchestrator.clone())
}

#[tokio::test]
async fn run_due_starts_recurring_playlists_only() -> Result<()> {
    let h = Harness::new().await?;
    let source = h.connection(Provider::Spotify, "s", None, None).await?;
    let destination = h.connection(Provider::Deezer, "d", None, None).await?;
    let daily = h
        .playlist_between(&source, &destination, SyncMode::AddOnly, SyncFrequency::Daily, None)
        .await?;
    let manual = h
        .playlist_between(&source, &destination, SyncMode::AddOnly, SyncFrequency::Manual, None)
        .await?;
    h.seed_source(&[track("t1", "Only Song", "Artist", None)]);

    let dispatcher = dispatcher(&h);
    assert_eq!(dispatcher.run_due().await?, 1);
    dispatcher.wait_idle().await;

    let jobs = h.orchestrator.jobs().list_for_playlist(daily.id).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_status()?, JobStatus::Completed);
    assert!(h.orchestrator.jobs().list_for_playlist(manual.id).await?.is_empty());

    let daily = h.orchestrator.playlists().require(daily.id).await?;
    assert!(daily.next_sync_at.is_some_and(|next| next > Utc::now()));

    // nothing is due until the next slot
    assert_eq!(dispatcher.run_due().await?, 0);
    assert_eq!(dispatcher.running_count(), 0);
    Ok(())
}

#[tokio::test]
async fn manual_trigger_reports_running_job() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::with(
        test_config(),
        FakePlatform::new(Provider::Spotify).with_fetch_gate(gate.clone()),
        FakePlatform::new(Provider::Deezer),
    )
    .await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&[track("t1", "Only Song", "Artist", None)]);

    let dispatcher = dispatcher(&h);
    let first = dispatcher.trigger_sync(playlist.id).await?;
    let TriggerOutcome::Started { job_id } = first else {
        panic!("expected a started job, got {:?}", first);
    };
    assert_eq!(
        dispatcher.trigger_sync(playlist.id).await?,
        TriggerOutcome::AlreadyRunning
    );

    gate.add_permits(1);
    dispatcher.wait_idle().await;

    let job = h.orchestrator.jobs().require(job_id).await?;
    assert_eq!(job.job_status()?, JobStatus::Completed);
    assert_eq!(dispatcher.running_count(), 0);
    Ok(())
}

#[tokio::test]
async fn cancel_stops_a_running_job() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::with(
        test_config(),
        FakePlatform::new(Provider::Spotify).with_fetch_gate(gate.clone()),
        FakePlatform::new(Provider::Deezer),
    )
    .await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&[
        track("t1", "First Song", "Artist", None),
        track("t2", "Second Song", "Artist", None),
    ]);

    let dispatcher = dispatcher(&h);
    let TriggerOutcome::Started { job_id } = dispatcher.trigger_sync(playlist.id).await? else {
        panic!("job did not start");
    };
    assert!(dispatcher.cancel(playlist.id));
    gate.add_permits(1);
    dispatcher.wait_idle().await;

    let job = h.orchestrator.jobs().require(job_id).await?;
    assert_eq!(job.job_status()?, JobStatus::Partial);
    assert_eq!(job.tracks_unmatched, 2);
    assert!(h.destination.state().added.is_empty());
    assert!(!dispatcher.cancel(playlist.id));
    Ok(())
}

#[tokio::test]
async fn deactivated_playlists_are_skipped() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Daily, None).await?;
    h.seed_source(&[track("t1", "Only Song", "Artist", None)]);

    let dispatcher = dispatcher(&h);
    let deactivated = dispatcher.deactivate_playlist(playlist.id).await?;
    assert!(!deactivated.is_active);

    assert_eq!(dispatcher.run_due().await?, 0);
    assert!(matches!(
        dispatcher.trigger_sync(playlist.id).await,
        Err(SyncError::InvalidPlaylist(_))
    ));
    // history and configuration are kept
    assert!(h.orchestrator.playlists().get(playlist.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn stale_jobs_are_failed_and_release_the_lock() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&[track("t1", "Only Song", "Artist", None)]);

    let jobs = h.orchestrator.jobs();
    let abandoned = jobs
        .insert_pending(playlist.id, SyncMode::AddOnly, Utc::now() - Duration::hours(3))
        .await?;

    let dispatcher = dispatcher(&h);
    assert_eq!(dispatcher.sweep_stale().await?, 1);

    let swept = jobs.require(abandoned.id).await?;
    assert_eq!(swept.job_status()?, JobStatus::Failed);
    assert_eq!(swept.error_message.as_deref(), Some("abandoned"));

    // a late finalize of the swept job is ignored
    let finalized = jobs
        .finalize(
            abandoned.id,
            JobCompletion {
                status: JobStatus::Completed,
                counts: JobCounts::default(),
                error_message: None,
                logs: json!([]),
                schedule: None,
            },
            Utc::now(),
        )
        .await?;
    assert!(!finalized);
    assert_eq!(jobs.require(abandoned.id).await?.job_status()?, JobStatus::Failed);

    assert!(matches!(
        dispatcher.trigger_sync(playlist.id).await?,
        TriggerOutcome::Started { .. }
    ));
    dispatcher.wait_idle().await;
    Ok(())
}

#[tokio::test]
async fn fresh_jobs_survive_the_sweep() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;

    let job = h
        .orchestrator
        .jobs()
        .insert_pending(playlist.id, SyncMode::AddOnly, Utc::now())
        .await?;
    assert_eq!(dispatcher(&h).sweep_stale().await?, 0);
    assert_eq!(
        h.orchestrator.jobs().require(job.id).await?.job_status()?,
        JobStatus::Pending
    );
    Ok(())
}

#[tokio::test]
async fn long_running_jobs_survive_the_sweep() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let mut config = test_config();
    config.dispatcher.stale_job_timeout_seconds = 1;
    let h = Harness::with(
        config,
        FakePlatform::new(Provider::Spotify).with_fetch_gate(gate.clone()),
        FakePlatform::new(Provider::Deezer),
    )
    .await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Daily, None).await?;
    h.seed_source(&[track("t1", "Only Song", "Artist", None)]);

    let dispatcher = dispatcher(&h);
    let TriggerOutcome::Started { job_id } = dispatcher.trigger_sync(playlist.id).await? else {
        panic!("job did not start");
    };
    tokio::time::sleep(StdDuration::from_millis(1_500)).await;

    // the owning dispatcher skips its own jobs
    assert_eq!(dispatcher.sweep_stale().await?, 0);
    // another dispatcher sees a recent heartbeat
    let other = Dispatcher::new(h.config.clone(), h.orchestrator.clone());
    assert_eq!(other.sweep_stale().await?, 0);

    assert_eq!(
        dispatcher.trigger_sync(playlist.id).await?,
        TriggerOutcome::AlreadyRunning
    );
    assert_eq!(dispatcher.run_due().await?, 0);

    gate.add_permits(1);
    dispatcher.wait_idle().await;

    let jobs = h.orchestrator.jobs().list_for_playlist(playlist.id).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert_eq!(jobs[0].job_status()?, JobStatus::Completed);
    assert_eq!(jobs[0].tracks_added, 1);
    Ok(())
}
