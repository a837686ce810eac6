//! Deezer API adapter
//!
//! Deezer authenticates with an `access_token` query parameter and reports
//! failures as HTTP 200 responses carrying an `error` object, so every body
//! is inspected before it is decoded.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::http::ApiClient;
use super::metadata::{AuthType, PlatformCapabilities, PlatformMetadata};
use super::trait_::{AccessContext, NormalizedTrack, PlatformAdapter, PlatformError, TokenGrant};
use crate::models::connection::Provider;

const PROVIDER: Provider = Provider::Deezer;
const PAGE_SIZE: usize = 100;
const WRITE_BATCH_SIZE: usize = 50;

const ERROR_QUOTA: i64 = 4;
const ERROR_INVALID_TOKEN: i64 = 200;
const ERROR_OAUTH: i64 = 300;
const ERROR_DATA_NOT_FOUND: i64 = 800;

pub const DEEZER_PERMISSIONS: &[&str] = &["basic_access", "manage_library", "offline_access"];

#[derive(Debug, Clone)]
pub struct DeezerConfig {
    pub api_base: String,
}

#[derive(Debug, Deserialize)]
struct DeezerArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbum {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    /// Negative for user-uploaded files
    id: i64,
    title: String,
    /// Seconds
    duration: Option<u64>,
    artist: Option<DeezerArtist>,
    album: Option<DeezerAlbum>,
    isrc: Option<String>,
}

impl From<DeezerTrack> for NormalizedTrack {
    fn from(track: DeezerTrack) -> Self {
        NormalizedTrack {
            provider_track_id: track.id.to_string(),
            title: track.title,
            artist: track.artist.map(|a| a.name).unwrap_or_default(),
            album: track.album.and_then(|a| a.title),
            duration_ms: track.duration.map(|secs| secs * 1000),
            isrc: track.isrc.filter(|isrc| !isrc.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrackList {
    #[serde(default)]
    data: Vec<DeezerTrack>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: u64,
}

/// Maps the `error` object of a Deezer body onto the adapter taxonomy.
fn deezer_error(error: &Value, resource: &str, default_retry_after_secs: u64) -> PlatformError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    match code {
        ERROR_QUOTA => {
            warn!(provider = %PROVIDER, "quota exceeded");
            PlatformError::RateLimited {
                provider: PROVIDER,
                retry_after_secs: default_retry_after_secs,
            }
        }
        ERROR_INVALID_TOKEN | ERROR_OAUTH => PlatformError::Auth {
            provider: PROVIDER,
            message,
        },
        ERROR_DATA_NOT_FOUND => PlatformError::NotFound {
            provider: PROVIDER,
            resource: resource.to_string(),
        },
        _ => PlatformError::Permanent {
            provider: PROVIDER,
            status: 200,
            message: format!("deezer error {}: {}", code, message),
        },
    }
}

fn decode<T: DeserializeOwned>(
    body: Value,
    resource: &str,
    default_retry_after_secs: u64,
) -> Result<T, PlatformError> {
    if let Some(error) = body.get("error") {
        return Err(deezer_error(error, resource, default_retry_after_secs));
    }
    serde_json::from_value(body).map_err(|e| PlatformError::MalformedResponse {
        provider: PROVIDER,
        message: e.to_string(),
    })
}

pub struct DeezerAdapter {
    config: DeezerConfig,
    api: ApiClient,
    capabilities: PlatformCapabilities,
}

impl DeezerAdapter {
    pub fn new(config: DeezerConfig, api: ApiClient) -> Self {
        Self {
            config,
            api,
            capabilities: Self::static_capabilities(),
        }
    }

    pub fn with_limits(mut self, page_size: Option<usize>, write_batch_size: Option<usize>) -> Self {
        self.capabilities = self.capabilities.with_limits(page_size, write_batch_size);
        self
    }

    pub fn metadata() -> PlatformMetadata {
        PlatformMetadata::new(
            PROVIDER,
            AuthType::QueryToken,
            DEEZER_PERMISSIONS.iter().map(|s| s.to_string()).collect(),
            Self::static_capabilities(),
        )
    }

    fn static_capabilities() -> PlatformCapabilities {
        PlatformCapabilities {
            can_read: true,
            can_write: true,
            can_export: true,
            can_remove: true,
            write_batch_size: WRITE_BATCH_SIZE,
            page_size: PAGE_SIZE,
        }
    }

    fn url(&self, path: &str, ctx: &AccessContext) -> Result<Url, PlatformError> {
        let mut url = Url::parse(&format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
        .map_err(|e| PlatformError::Permanent {
            provider: PROVIDER,
            status: 0,
            message: format!("invalid url: {}", e),
        })?;
        url.query_pairs_mut()
            .append_pair("access_token", &ctx.access_token);
        Ok(url)
    }

    /// Sends a request with the retry policy covering both HTTP throttling
    /// and in-body quota errors.
    async fn call<T, B>(
        &self,
        operation: &'static str,
        resource: &str,
        build: B,
    ) -> Result<T, PlatformError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        let api = &self.api;
        let default_retry_after = api.retry().default_retry_after_secs();
        api.retry()
            .run(operation, || {
                let request = build(api.http());
                async move {
                    let body: Value = api.send_once(resource, request).await?;
                    decode(body, resource, default_retry_after)
                }
            })
            .await
    }

    async fn track_ids_request(
        &self,
        operation: &'static str,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
        delete: bool,
    ) -> Result<(), PlatformError> {
        let resource = format!("playlist {}", playlist_id);
        for batch in track_ids.chunks(self.capabilities.write_batch_size) {
            let mut url = self.url(&format!("playlist/{}/tracks", playlist_id), ctx)?;
            url.query_pairs_mut().append_pair("songs", &batch.join(","));
            let _: Value = self
                .call(operation, &resource, |http| {
                    if delete {
                        http.delete(url.clone())
                    } else {
                        http.post(url.clone())
                    }
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for DeezerAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    async fn fetch_playlist_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        let resource = format!("playlist {}", playlist_id);
        let mut tracks: Vec<NormalizedTrack> = Vec::new();

        loop {
            let mut url = self.url(&format!("playlist/{}/tracks", playlist_id), ctx)?;
            url.query_pairs_mut()
                .append_pair("index", &tracks.len().to_string())
                .append_pair("limit", &self.capabilities.page_size.to_string());

            let page: TrackList = self
                .call("fetch_playlist_tracks", &resource, |http| {
                    http.get(url.clone())
                })
                .await?;

            let received = page.data.len();
            tracks.extend(page.data.into_iter().map(NormalizedTrack::from));
            if page.next.is_none() || received == 0 {
                break;
            }
        }

        debug!(playlist_id, count = tracks.len(), "fetched deezer playlist");
        Ok(tracks)
    }

    async fn search_track(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        let mut url = self.url("search/track", ctx)?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("limit", &limit.max(1).to_string());

        let results: TrackList = self
            .call("search_track", "search", |http| http.get(url.clone()))
            .await?;
        Ok(results.data.into_iter().map(NormalizedTrack::from).collect())
    }

    async fn search_by_isrc(
        &self,
        ctx: &AccessContext,
        isrc: &str,
    ) -> Result<Option<NormalizedTrack>, PlatformError> {
        let url = self.url(&format!("track/isrc:{}", isrc.trim()), ctx)?;
        let result: Result<DeezerTrack, PlatformError> = self
            .call("search_by_isrc", "isrc", |http| http.get(url.clone()))
            .await;

        match result {
            Ok(track) => Ok(Some(track.into())),
            Err(PlatformError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        title: &str,
        _description: &str,
    ) -> Result<String, PlatformError> {
        let user_id = match &ctx.provider_user_id {
            Some(id) => id.clone(),
            None => {
                let url = self.url("user/me", ctx)?;
                let me: IdResponse = self
                    .call("current_user", "current user", |http| http.get(url.clone()))
                    .await?;
                me.id.to_string()
            }
        };

        let mut url = self.url(&format!("user/{}/playlists", user_id), ctx)?;
        url.query_pairs_mut().append_pair("title", title);
        let created: IdResponse = self
            .call("create_playlist", "user playlists", |http| {
                http.post(url.clone())
            })
            .await?;

        info!(playlist_id = created.id, "created deezer playlist");
        Ok(created.id.to_string())
    }

    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        self.track_ids_request("add_tracks", ctx, playlist_id, track_ids, false)
            .await
    }

    async fn remove_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        self.track_ids_request("remove_tracks", ctx, playlist_id, track_ids, true)
            .await
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        Err(PlatformError::Auth {
            provider: PROVIDER,
            message: "deezer tokens cannot be refreshed".to_string(),
        })
    }
}
