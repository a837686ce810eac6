//! End-to-end sync runs against in-memory platforms and a SQLite database.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use playlist_sync::error::SyncError;
use playlist_sync::models::connection::{ConnectionStatus, Provider};
use playlist_sync::models::playlist::{SyncFrequency, SyncMode};
use playlist_sync::models::sync_job::JobStatus;
use playlist_sync::models::sync_log::TrackStatus;
use playlist_sync::platforms::{PlatformCapabilities, PlatformError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use test_utils::{FakePlatform, Harness, test_config, track};

fn tracks(n: usize) -> Vec<playlist_sync::platforms::NormalizedTrack> {
    (1..=n)
        .map(|i| track(&format!("t{}", i), &format!("Song Number {}", i), "The Band", None))
        .collect()
}

fn events(job: &playlist_sync::models::sync_job::Model) -> Vec<String> {
    job.logs
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|e| e["event"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn unmatched_and_rate_limited_tracks_make_the_run_partial() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Daily, None).await?;
    let source = tracks(10);
    h.seed_source(&source);
    {
        let mut dest = h.destination.state();
        dest.catalog.retain(|t| t.provider_track_id != "dest-t4");
        dest.add_errors.insert(
            "dest-t9".to_string(),
            PlatformError::RateLimited {
                provider: Provider::Deezer,
                retry_after_secs: 30,
            },
        );
    }

    let before = Utc::now();
    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;

    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.counts.total, 10);
    assert_eq!(report.counts.matched, 8);
    assert_eq!(report.counts.unmatched, 2);
    assert_eq!(report.counts.added, 8);

    let job = h.orchestrator.jobs().require(report.job_id).await?;
    assert_eq!(job.status, "partial");
    assert_eq!(job.tracks_matched, 8);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(events(&job).contains(&"destination_created".to_string()));

    let logs = h.orchestrator.logs().list_for_job(report.job_id).await?;
    assert_eq!(logs.len(), 10);
    let positions: Vec<i32> = logs.iter().map(|l| l.position).collect();
    assert_eq!(positions, (0..10).collect::<Vec<_>>());
    assert_eq!(logs[3].status, "unmatched");
    assert_eq!(logs[3].dest_track_id, None);
    assert_eq!(logs[8].status, "write_failed");
    assert_eq!(logs[8].dest_track_id.as_deref(), Some("dest-t9"));
    assert!(
        logs[8]
            .error_details
            .as_deref()
            .is_some_and(|d| d.starts_with("write failed") && d.contains("rate limit exceeded"))
    );
    assert_eq!(
        logs.iter().filter(|l| l.status == "write_failed").count(),
        1
    );
    assert_eq!(logs[0].status, "written");
    assert_eq!(logs[0].dest_track_id.as_deref(), Some("dest-t1"));

    let playlist = h.orchestrator.playlists().require(playlist.id).await?;
    assert_eq!(playlist.destination_playlist_id.as_deref(), Some("created-1"));
    assert!(playlist.last_synced_at.is_some());
    let next = playlist.next_sync_at.expect("daily playlist is rescheduled");
    assert!(next >= before + Duration::days(1));
    assert!(next <= Utc::now() + Duration::days(1) + Duration::hours(2));
    assert_eq!(h.destination.state().added.len(), 8);
    assert!(!h.destination.state().added.contains(&"dest-t9".to_string()));
    Ok(())
}

#[tokio::test]
async fn rerun_without_changes_adds_nothing() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&tracks(4));

    let first = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.counts.added, 4);

    let second = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.counts.added, 0);
    assert_eq!(second.counts.matched, 4);
    assert_eq!(h.destination.state().added.len(), 4);
    assert_eq!(h.destination.state().created_playlists.len(), 1);

    let logs = h.orchestrator.logs().list_for_job(second.job_id).await?;
    assert!(logs.iter().all(|l| l.status == TrackStatus::Matched.as_str()));

    let playlist = h.orchestrator.playlists().require(playlist.id).await?;
    assert_eq!(playlist.next_sync_at, None);
    Ok(())
}

#[tokio::test]
async fn second_start_while_running_is_rejected() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::with(
        test_config(),
        FakePlatform::new(Provider::Spotify).with_fetch_gate(gate.clone()),
        FakePlatform::new(Provider::Deezer),
    )
    .await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Daily, None).await?;
    h.seed_source(&tracks(2));

    let orchestrator = h.orchestrator.clone();
    let playlist_id = playlist.id;
    let running = tokio::spawn(async move {
        orchestrator
            .sync_playlist(playlist_id, CancellationToken::new())
            .await
    });

    let mut active = None;
    for _ in 0..100 {
        active = h.orchestrator.jobs().active_for_playlist(playlist.id).await?;
        if active.is_some() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(active.is_some(), "first job never became active");

    let second = h.orchestrator.start_job(playlist.id).await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning { .. })));

    gate.add_permits(1);
    let report = running.await??;
    assert_eq!(report.status, JobStatus::Completed);

    let jobs = h.orchestrator.jobs().list_for_playlist(playlist.id).await?;
    assert_eq!(jobs.len(), 1);
    assert!(h.orchestrator.jobs().active_for_playlist(playlist.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn source_failure_fails_the_job_without_logs() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Daily, None).await?;
    h.seed_source(&tracks(3));
    h.source.state().fetch_error = Some(PlatformError::Transient {
        provider: Provider::Spotify,
        message: "upstream 503".to_string(),
    });

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Failed);
    assert!(
        report
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("failed to fetch source playlist"))
    );

    assert!(h.orchestrator.logs().list_for_job(report.job_id).await?.is_empty());
    let playlist = h.orchestrator.playlists().require(playlist.id).await?;
    assert_eq!(playlist.last_synced_at, None);
    assert_eq!(playlist.next_sync_at, None);

    // lock is released
    h.source.state().fetch_error = None;
    let retry = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(retry.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn isrc_match_wins_over_title_differences() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.source.state().playlists.insert(
        "source-1".to_string(),
        vec![track("sp-halo", "Halo", "Beyoncé", Some("USSM10803245"))],
    );
    h.destination.state().catalog.push(track(
        "dz-halo",
        "Halo (Remastered 2019)",
        "Beyonce",
        Some("USSM10803245"),
    ));

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Completed);

    let logs = h.orchestrator.logs().list_for_job(report.job_id).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].dest_track_id.as_deref(), Some("dz-halo"));
    assert!((logs[0].confidence_score - 1.0).abs() < f64::EPSILON);
    assert_eq!(logs[0].status, "written");
    assert_eq!(h.destination.state().searches, 0);
    Ok(())
}

#[tokio::test]
async fn mirror_removes_tracks_missing_from_source() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h
        .playlist(SyncMode::Mirror, SyncFrequency::Weekly, Some("dest-pl"))
        .await?;
    h.seed_source(&tracks(2));
    h.destination.state().playlists.insert(
        "dest-pl".to_string(),
        vec![
            track("dest-t1", "Song Number 1", "The Band", None),
            track("stale", "Old Song", "Someone", None),
        ],
    );

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.added, 1);
    assert_eq!(h.destination.state().removed, vec!["stale".to_string()]);
    assert_eq!(h.destination.state().added, vec!["dest-t2".to_string()]);

    let job = h.orchestrator.jobs().require(report.job_id).await?;
    assert!(events(&job).contains(&"tracks_removed".to_string()));
    Ok(())
}

#[tokio::test]
async fn failed_removal_makes_mirror_partial() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h
        .playlist(SyncMode::Mirror, SyncFrequency::Daily, Some("dest-pl"))
        .await?;
    h.seed_source(&tracks(1));
    {
        let mut dest = h.destination.state();
        dest.playlists.insert(
            "dest-pl".to_string(),
            vec![track("stale", "Old Song", "Someone", None)],
        );
        dest.remove_error = Some(PlatformError::Permanent {
            provider: Provider::Deezer,
            status: 403,
            message: "forbidden".to_string(),
        });
    }

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.counts.unmatched, 0);

    let job = h.orchestrator.jobs().require(report.job_id).await?;
    assert!(events(&job).contains(&"removal_failed".to_string()));
    // partial runs still advance the schedule
    let playlist = h.orchestrator.playlists().require(playlist.id).await?;
    assert!(playlist.next_sync_at.is_some());
    Ok(())
}

#[tokio::test]
async fn cancellation_marks_remaining_tracks_unmatched() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h
        .playlist(SyncMode::Mirror, SyncFrequency::Daily, Some("dest-pl"))
        .await?;
    h.seed_source(&tracks(5));
    let cancel = CancellationToken::new();
    {
        let mut dest = h.destination.state();
        dest.playlists.insert(
            "dest-pl".to_string(),
            vec![track("stale", "Old Song", "Someone", None)],
        );
        dest.cancel_after_searches = Some((2, cancel.clone()));
    }

    let report = h.orchestrator.sync_playlist(playlist.id, cancel).await?;
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.counts.total, 5);
    assert_eq!(report.counts.matched, 2);
    assert_eq!(report.counts.unmatched, 3);

    let logs = h.orchestrator.logs().list_for_job(report.job_id).await?;
    assert_eq!(logs.len(), 5);
    for log in &logs[2..] {
        assert_eq!(log.status, "unmatched");
        assert_eq!(log.error_details.as_deref(), Some("cancelled before processing"));
    }
    // no removals after cancellation
    assert!(h.destination.state().removed.is_empty());
    let job = h.orchestrator.jobs().require(report.job_id).await?;
    assert!(events(&job).contains(&"cancelled".to_string()));
    Ok(())
}

#[tokio::test]
async fn export_only_matches_without_writing() -> Result<()> {
    let h = Harness::with(
        test_config(),
        FakePlatform::new(Provider::Spotify),
        FakePlatform::new(Provider::AppleMusic)
            .with_capabilities(PlatformCapabilities::read_only(100)),
    )
    .await?;
    let source = h.connection(Provider::Spotify, "source-token", None, None).await?;
    let destination = h.connection(Provider::AppleMusic, "apple-token", None, None).await?;
    let playlist = h
        .playlist_between(
            &source,
            &destination,
            SyncMode::ExportOnly,
            SyncFrequency::Manual,
            None,
        )
        .await?;
    h.seed_source(&tracks(3));

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.matched, 3);
    assert_eq!(report.counts.added, 0);

    let state = h.destination.state();
    assert!(state.added.is_empty());
    assert!(state.created_playlists.is_empty());
    Ok(())
}

#[tokio::test]
async fn write_mode_on_read_only_destination_is_rejected() -> Result<()> {
    let h = Harness::with(
        test_config(),
        FakePlatform::new(Provider::Spotify),
        FakePlatform::new(Provider::AppleMusic)
            .with_capabilities(PlatformCapabilities::read_only(100)),
    )
    .await?;
    let source = h.connection(Provider::Spotify, "source-token", None, None).await?;
    let destination = h.connection(Provider::AppleMusic, "apple-token", None, None).await?;

    let result = h
        .playlist_between(
            &source,
            &destination,
            SyncMode::AddOnly,
            SyncFrequency::Manual,
            None,
        )
        .await;
    let err = result.expect_err("add_only needs a writable destination");
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::InvalidPlaylist(_))
    ));
    Ok(())
}

#[tokio::test]
async fn rejected_token_is_refreshed_and_call_retried() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&tracks(2));
    {
        let mut source = h.source.state();
        source.valid_token = Some("fresh-token".to_string());
        source.refresh_to = Some("fresh-token".to_string());
    }

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(h.source.state().refresh_calls, 1);

    let connection = h
        .orchestrator
        .connections()
        .require(playlist.source_connection_id)
        .await?;
    assert_eq!(connection.connection_status()?, ConnectionStatus::Connected);
    let tokens = h.orchestrator.connections().open_tokens(&connection)?;
    assert_eq!(tokens.access_token.as_deref(), Some("fresh-token"));
    assert_eq!(tokens.refresh_token.as_deref(), Some("source-refresh"));
    Ok(())
}

#[tokio::test]
async fn failed_refresh_expires_connection_and_fails_job() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Daily, None).await?;
    h.seed_source(&tracks(2));
    h.source.state().valid_token = Some("never-issued".to_string());

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Failed);

    let connection = h
        .orchestrator
        .connections()
        .require(playlist.source_connection_id)
        .await?;
    assert_eq!(connection.connection_status()?, ConnectionStatus::Expired);

    // expired connections fail preflight
    let again = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(again.status, JobStatus::Failed);
    assert!(
        again
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("expired"))
    );
    Ok(())
}

#[tokio::test]
async fn write_failures_are_recorded_per_track() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&tracks(3));
    h.destination
        .state()
        .failing_adds
        .insert("dest-t2".to_string());

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.counts.added, 2);
    assert_eq!(report.counts.unmatched, 1);

    let logs = h.orchestrator.logs().list_for_job(report.job_id).await?;
    assert_eq!(logs[1].status, "write_failed");
    assert_eq!(logs[1].dest_track_id.as_deref(), Some("dest-t2"));
    assert!(
        logs[1]
            .error_details
            .as_deref()
            .is_some_and(|d| d.starts_with("write failed"))
    );
    Ok(())
}

#[tokio::test]
async fn duplicate_source_tracks_are_written_once() -> Result<()> {
    let mut config = test_config();
    config.orchestrator.write_concurrency = 4;
    let h = Harness::with(
        config,
        FakePlatform::new(Provider::Spotify),
        FakePlatform::new(Provider::Deezer),
    )
    .await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    let song = track("t1", "Song Number 1", "The Band", None);
    h.seed_source(std::slice::from_ref(&song));
    h.source.state().playlists.insert(
        "source-1".to_string(),
        vec![song.clone(), track("t1-copy", "Song Number 1", "The Band", None)],
    );

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.matched, 2);
    assert_eq!(report.counts.added, 1);
    assert_eq!(h.destination.state().added, vec!["dest-t1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn vanished_destination_playlist_is_recreated() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h
        .playlist(SyncMode::AddOnly, SyncFrequency::Manual, Some("deleted-pl"))
        .await?;
    h.seed_source(&tracks(1));

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Completed);

    let playlist = h.orchestrator.playlists().require(playlist.id).await?;
    assert_eq!(playlist.destination_playlist_id.as_deref(), Some("created-1"));
    let job = h.orchestrator.jobs().require(report.job_id).await?;
    assert!(events(&job).contains(&"destination_recreated".to_string()));
    Ok(())
}

#[tokio::test]
async fn search_errors_leave_tracks_unmatched() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h.playlist(SyncMode::AddOnly, SyncFrequency::Manual, None).await?;
    h.seed_source(&tracks(2));
    h.destination.state().search_error = Some(PlatformError::RateLimited {
        provider: Provider::Deezer,
        retry_after_secs: 1,
    });

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.counts.unmatched, 2);

    let logs = h.orchestrator.logs().list_for_job(report.job_id).await?;
    assert!(logs.iter().all(|l| {
        l.error_details
            .as_deref()
            .is_some_and(|d| d.starts_with("search failed (rate_limited)"))
    }));
    Ok(())
}

#[tokio::test]
async fn failed_searches_suspend_mirror_removal() -> Result<()> {
    let h = Harness::new().await?;
    let playlist = h
        .playlist(SyncMode::Mirror, SyncFrequency::Daily, Some("dest-pl"))
        .await?;
    h.seed_source(&tracks(1));
    {
        let mut dest = h.destination.state();
        dest.playlists.insert(
            "dest-pl".to_string(),
            vec![track("dest-t1", "Song Number 1", "The Band", None)],
        );
        dest.search_error = Some(PlatformError::RateLimited {
            provider: Provider::Deezer,
            retry_after_secs: 1,
        });
    }

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.counts.unmatched, 1);
    assert!(h.destination.state().removed.is_empty());
    assert_eq!(
        h.destination.state().playlists["dest-pl"].len(),
        1,
        "destination copy must survive a failed search"
    );

    let job = h.orchestrator.jobs().require(report.job_id).await?;
    let skipped = job
        .logs
        .as_array()
        .and_then(|items| items.iter().find(|e| e["event"] == "removal_skipped"))
        .cloned()
        .expect("removal_skipped event");
    assert_eq!(skipped["details"]["reason"], "incomplete match");
    assert!(!events(&job).contains(&"tracks_removed".to_string()));
    Ok(())
}

#[tokio::test]
async fn rejected_token_without_refresh_token_expires_connection() -> Result<()> {
    let h = Harness::new().await?;
    let source = h
        .connection(Provider::Spotify, "source-token", Some("source-refresh"), None)
        .await?;
    let destination = h.connection(Provider::Deezer, "dest-token", None, None).await?;
    let playlist = h
        .playlist_between(&source, &destination, SyncMode::AddOnly, SyncFrequency::Daily, None)
        .await?;
    h.seed_source(&tracks(2));
    h.destination.state().valid_token = Some("revoked-elsewhere".to_string());

    let report = h
        .orchestrator
        .sync_playlist(playlist.id, CancellationToken::new())
        .await?;
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(h.destination.state().refresh_calls, 0);

    let job = h.orchestrator.jobs().require(report.job_id).await?;
    assert_eq!(job.job_status()?, JobStatus::Failed);
    let destination = h.orchestrator.connections().require(destination.id).await?;
    assert_eq!(destination.connection_status()?, ConnectionStatus::Expired);
    let source = h.orchestrator.connections().require(source.id).await?;
    assert_eq!(source.connection_status()?, ConnectionStatus::Connected);
    Ok(())
}
