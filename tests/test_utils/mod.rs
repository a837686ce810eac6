//! Test utilities shared by the integration tests.
//!
//! Provides a migrated SQLite database in a temporary directory, a scriptable
//! in-memory platform adapter and fixtures for connections and playlists.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use playlist_sync::config::AppConfig;
use playlist_sync::db;
use playlist_sync::models::connection::{Model as ConnectionModel, Provider};
use playlist_sync::models::playlist::{Model as PlaylistModel, SyncFrequency, SyncMode};
use playlist_sync::orchestrator::SyncOrchestrator;
use playlist_sync::platforms::{
    AccessContext, AuthType, NormalizedTrack, PlatformAdapter, PlatformCapabilities,
    PlatformError, PlatformMetadata, PlatformRegistry, TokenGrant,
};
use playlist_sync::repositories::{NewConnection, NewPlaylist};
use sea_orm::DatabaseConnection;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const TEST_KEY: [u8; 32] = [7u8; 32];

/// Migrated SQLite database backed by a file, so every pooled connection
/// sees the same data. The directory is removed on drop.
pub struct TestDb {
    pub db: Arc<DatabaseConnection>,
    _dir: TempDir,
}

pub async fn setup_test_db() -> Result<TestDb> {
    let dir = TempDir::new()?;
    let path = dir.path().join("playlist_sync.db");
    let config = AppConfig {
        database_url: format!("sqlite://{}?mode=rwc", path.display()),
        db_max_connections: 5,
        ..AppConfig::default()
    };
    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None).await?;
    Ok(TestDb {
        db: Arc::new(db),
        _dir: dir,
    })
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        crypto_key: Some(TEST_KEY.to_vec()),
        ..AppConfig::default()
    };
    config.orchestrator.write_concurrency = 1;
    config
}

pub fn track(id: &str, title: &str, artist: &str, isrc: Option<&str>) -> NormalizedTrack {
    NormalizedTrack {
        provider_track_id: id.to_string(),
        title: title.to_string(),
        artist: artist.to_string(),
        album: None,
        duration_ms: Some(200_000),
        isrc: isrc.map(str::to_string),
    }
}

/// Mutable behavior and recorded calls of a [`FakePlatform`].
#[derive(Default)]
pub struct FakeState {
    /// Playlist id to tracks
    pub playlists: HashMap<String, Vec<NormalizedTrack>>,
    /// Tracks returned by search and ISRC lookup
    pub catalog: Vec<NormalizedTrack>,
    /// Track ids whose add fails with a permanent error
    pub failing_adds: HashSet<String>,
    /// Track ids whose add fails with the given error
    pub add_errors: HashMap<String, PlatformError>,
    pub fetch_error: Option<PlatformError>,
    pub search_error: Option<PlatformError>,
    pub remove_error: Option<PlatformError>,
    /// When set, calls with any other access token fail with `Auth`
    pub valid_token: Option<String>,
    /// Access token handed out by a successful refresh
    pub refresh_to: Option<String>,
    /// Cancels the token once this many searches have run
    pub cancel_after_searches: Option<(usize, CancellationToken)>,
    pub created_playlists: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub searches: usize,
    pub refresh_calls: usize,
}

/// In-memory adapter with scriptable failures.
pub struct FakePlatform {
    provider: Provider,
    capabilities: PlatformCapabilities,
    state: Mutex<FakeState>,
    /// When present, every fetch waits for a permit
    fetch_gate: Option<Arc<Semaphore>>,
}

impl FakePlatform {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            capabilities: PlatformCapabilities {
                can_read: true,
                can_write: true,
                can_export: true,
                can_remove: true,
                write_batch_size: 100,
                page_size: 100,
            },
            state: Mutex::new(FakeState::default()),
            fetch_gate: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_fetch_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.fetch_gate = Some(gate);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn metadata(&self) -> PlatformMetadata {
        PlatformMetadata::new(self.provider, AuthType::OAuth2, Vec::new(), self.capabilities)
    }

    fn check_token(&self, ctx: &AccessContext) -> Result<(), PlatformError> {
        let state = self.state();
        match &state.valid_token {
            Some(valid) if valid != &ctx.access_token => Err(PlatformError::Auth {
                provider: self.provider,
                message: "token rejected".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformAdapter for FakePlatform {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    async fn fetch_playlist_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        if let Some(gate) = &self.fetch_gate {
            let _permit = gate.acquire().await.map_err(|_| PlatformError::Timeout {
                provider: self.provider,
            })?;
        }
        self.check_token(ctx)?;
        let state = self.state();
        if let Some(err) = &state.fetch_error {
            return Err(err.clone());
        }
        state
            .playlists
            .get(playlist_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound {
                provider: self.provider,
                resource: format!("playlist {}", playlist_id),
            })
    }

    async fn search_track(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        self.check_token(ctx)?;
        let mut state = self.state();
        state.searches += 1;
        if let Some((after, token)) = &state.cancel_after_searches {
            if state.searches >= *after {
                token.cancel();
            }
        }
        if let Some(err) = &state.search_error {
            return Err(err.clone());
        }
        let query = query.to_lowercase();
        Ok(state
            .catalog
            .iter()
            .filter(|t| query.contains(&t.title.to_lowercase()))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn search_by_isrc(
        &self,
        ctx: &AccessContext,
        isrc: &str,
    ) -> Result<Option<NormalizedTrack>, PlatformError> {
        self.check_token(ctx)?;
        let state = self.state();
        Ok(state
            .catalog
            .iter()
            .find(|t| t.isrc.as_deref() == Some(isrc))
            .cloned())
    }

    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        title: &str,
        _description: &str,
    ) -> Result<String, PlatformError> {
        self.check_token(ctx)?;
        let mut state = self.state();
        let id = format!("created-{}", state.created_playlists.len() + 1);
        state.created_playlists.push(title.to_string());
        state.playlists.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        self.check_token(ctx)?;
        let mut state = self.state();
        if let Some(err) = track_ids.iter().find_map(|id| state.add_errors.get(id)) {
            return Err(err.clone());
        }
        if let Some(id) = track_ids.iter().find(|id| state.failing_adds.contains(*id)) {
            return Err(PlatformError::Permanent {
                provider: self.provider,
                status: 400,
                message: format!("cannot add {}", id),
            });
        }
        let additions: Vec<NormalizedTrack> = track_ids
            .iter()
            .map(|id| {
                state
                    .catalog
                    .iter()
                    .find(|t| &t.provider_track_id == id)
                    .cloned()
                    .unwrap_or_else(|| track(id, id, "unknown", None))
            })
            .collect();
        state.added.extend(track_ids.iter().cloned());
        state
            .playlists
            .entry(playlist_id.to_string())
            .or_default()
            .extend(additions);
        Ok(())
    }

    async fn remove_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        self.check_token(ctx)?;
        let mut state = self.state();
        if let Some(err) = &state.remove_error {
            return Err(err.clone());
        }
        state.removed.extend(track_ids.iter().cloned());
        if let Some(tracks) = state.playlists.get_mut(playlist_id) {
            tracks.retain(|t| !track_ids.contains(&t.provider_track_id));
        }
        Ok(())
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let mut state = self.state();
        state.refresh_calls += 1;
        match &state.refresh_to {
            Some(token) => Ok(TokenGrant {
                access_token: token.clone(),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
            }),
            None => Err(PlatformError::Auth {
                provider: self.provider,
                message: "invalid_grant".to_string(),
            }),
        }
    }
}

/// Orchestrator wired to a Spotify-flavored fake source and a Deezer-flavored
/// fake destination.
pub struct Harness {
    pub test_db: TestDb,
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub source: Arc<FakePlatform>,
    pub destination: Arc<FakePlatform>,
    pub user_id: Uuid,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with(test_config(), FakePlatform::new(Provider::Spotify), FakePlatform::new(Provider::Deezer)).await
    }

    pub async fn with(config: AppConfig, source: FakePlatform, destination: FakePlatform) -> Result<Self> {
        let test_db = setup_test_db().await?;
        let config = Arc::new(config);
        let source = Arc::new(source);
        let destination = Arc::new(destination);

        let mut registry = PlatformRegistry::new();
        registry.register(source.clone(), source.metadata());
        registry.register(destination.clone(), destination.metadata());

        let orchestrator = Arc::new(SyncOrchestrator::build(
            config.clone(),
            test_db.db.clone(),
            registry,
        )?);

        Ok(Self {
            test_db,
            config,
            orchestrator,
            source,
            destination,
            user_id: Uuid::new_v4(),
        })
    }

    pub async fn connection(
        &self,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ConnectionModel> {
        Ok(self
            .orchestrator
            .connections()
            .create(NewConnection {
                user_id: self.user_id,
                provider,
                provider_user_id: Some("listener".to_string()),
                access_token: access_token.to_string(),
                refresh_token: refresh_token.map(str::to_string),
                expires_at,
                scope: None,
                can_read: true,
                can_write: true,
                can_export: true,
            })
            .await?)
    }

    /// Connections for both fakes plus a playlist reading `source-1`.
    pub async fn playlist(
        &self,
        mode: SyncMode,
        frequency: SyncFrequency,
        destination_playlist_id: Option<&str>,
    ) -> Result<PlaylistModel> {
        let source = self.connection(Provider::Spotify, "source-token", Some("source-refresh"), None).await?;
        let destination = self
            .connection(Provider::Deezer, "dest-token", Some("dest-refresh"), None)
            .await?;
        self.playlist_between(&source, &destination, mode, frequency, destination_playlist_id)
            .await
    }

    pub async fn playlist_between(
        &self,
        source: &ConnectionModel,
        destination: &ConnectionModel,
        mode: SyncMode,
        frequency: SyncFrequency,
        destination_playlist_id: Option<&str>,
    ) -> Result<PlaylistModel> {
        Ok(self
            .orchestrator
            .playlists()
            .create(
                NewPlaylist {
                    user_id: self.user_id,
                    name: "Road Trip".to_string(),
                    source_connection_id: source.id,
                    source_playlist_id: "source-1".to_string(),
                    destination_connection_id: destination.id,
                    destination_playlist_id: destination_playlist_id.map(str::to_string),
                    sync_mode: mode,
                    sync_frequency: frequency,
                },
                source,
                destination,
                &self.destination.capabilities(),
            )
            .await?)
    }

    /// Puts `tracks` in the source playlist and makes each findable on the
    /// destination under a `dest-` id.
    pub fn seed_source(&self, tracks: &[NormalizedTrack]) {
        self.source
            .state()
            .playlists
            .insert("source-1".to_string(), tracks.to_vec());
        let mut dest = self.destination.state();
        for t in tracks {
            dest.catalog.push(NormalizedTrack {
                provider_track_id: format!("dest-{}", t.provider_track_id),
                ..t.clone()
            });
        }
    }
}
