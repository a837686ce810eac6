//! Apple Music API adapter
//!
//! Requests carry the developer token as the bearer and the connection's
//! token as `Music-User-Token`. Library playlists are read-only here, so the
//! adapter only serves as a source or as an export-only destination.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::http::ApiClient;
use super::metadata::{AuthType, PlatformCapabilities, PlatformMetadata};
use super::trait_::{AccessContext, NormalizedTrack, PlatformAdapter, PlatformError, TokenGrant};
use crate::models::connection::Provider;

const PROVIDER: Provider = Provider::AppleMusic;
const PAGE_SIZE: usize = 100;
const MAX_SEARCH_LIMIT: u32 = 25;

#[derive(Debug, Clone)]
pub struct AppleMusicConfig {
    pub api_base: String,
    pub developer_token: Option<String>,
    pub storefront: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongAttributes {
    name: String,
    #[serde(default)]
    artist_name: String,
    album_name: Option<String>,
    duration_in_millis: Option<u64>,
    isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Song {
    id: String,
    attributes: Option<SongAttributes>,
}

impl Song {
    fn normalize(self) -> Option<NormalizedTrack> {
        let attributes = self.attributes?;
        Some(NormalizedTrack {
            provider_track_id: self.id,
            title: attributes.name,
            artist: attributes.artist_name,
            album: attributes.album_name,
            duration_ms: attributes.duration_in_millis,
            isrc: attributes.isrc,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SongPage {
    #[serde(default)]
    data: Vec<Song>,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    songs: Option<SongPage>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Option<SearchResults>,
}

pub struct AppleMusicAdapter {
    config: AppleMusicConfig,
    api: ApiClient,
    capabilities: PlatformCapabilities,
}

impl AppleMusicAdapter {
    pub fn new(config: AppleMusicConfig, api: ApiClient) -> Self {
        Self {
            config,
            api,
            capabilities: PlatformCapabilities::read_only(PAGE_SIZE),
        }
    }

    pub fn with_limits(mut self, page_size: Option<usize>) -> Self {
        self.capabilities = self.capabilities.with_limits(page_size, None);
        self
    }

    pub fn metadata() -> PlatformMetadata {
        PlatformMetadata::new(
            PROVIDER,
            AuthType::DeveloperToken,
            Vec::new(),
            PlatformCapabilities::read_only(PAGE_SIZE),
        )
    }

    fn developer_token(&self) -> Result<&str, PlatformError> {
        self.config
            .developer_token
            .as_deref()
            .ok_or_else(|| PlatformError::Auth {
                provider: PROVIDER,
                message: "apple music developer token is not configured".to_string(),
            })
    }

    fn url(&self, path: &str) -> Result<Url, PlatformError> {
        Url::parse(&format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
        .map_err(|e| PlatformError::Permanent {
            provider: PROVIDER,
            status: 0,
            message: format!("invalid url: {}", e),
        })
    }

    fn write_not_supported<T>() -> Result<T, PlatformError> {
        Err(PlatformError::WriteNotSupported { provider: PROVIDER })
    }
}

#[async_trait]
impl PlatformAdapter for AppleMusicAdapter {
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
        let developer_token = self.developer_token()?;
        let resource = format!("library playlist {}", playlist_id);
        let page_size = self.capabilities.page_size;
        let mut tracks = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut url = self.url(&format!("v1/me/library/playlists/{}/tracks", playlist_id))?;
            url.query_pairs_mut()
                .append_pair("offset", &offset.to_string())
                .append_pair("limit", &page_size.to_string());

            let result: Result<SongPage, PlatformError> = self
                .api
                .json("fetch_playlist_tracks", &resource, |http| {
                    http.get(url.clone())
                        .bearer_auth(developer_token)
                        .header("Music-User-Token", &ctx.access_token)
                })
                .await;

            let page = match result {
                Ok(page) => page,
                // The library API answers 404 once the offset passes the end
                Err(PlatformError::NotFound { .. }) if offset > 0 => break,
                Err(err) => return Err(err),
            };

            let received = page.data.len();
            tracks.extend(page.data.into_iter().filter_map(Song::normalize));
            if received < page_size {
                break;
            }
            offset += received;
        }

        debug!(playlist_id, count = tracks.len(), "fetched apple music playlist");
        Ok(tracks)
    }

    async fn search_track(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        let developer_token = self.developer_token()?;
        let mut url = self.url(&format!("v1/catalog/{}/search", self.config.storefront))?;
        url.query_pairs_mut()
            .append_pair("term", query)
            .append_pair("types", "songs")
            .append_pair("limit", &limit.clamp(1, MAX_SEARCH_LIMIT).to_string());

        let response: SearchResponse = self
            .api
            .json("search_track", "catalog search", |http| {
                http.get(url.clone())
                    .bearer_auth(developer_token)
                    .header("Music-User-Token", &ctx.access_token)
            })
            .await?;

        Ok(response
            .results
            .and_then(|r| r.songs)
            .unwrap_or_default()
            .data
            .into_iter()
            .filter_map(Song::normalize)
            .collect())
    }

    async fn search_by_isrc(
        &self,
        ctx: &AccessContext,
        isrc: &str,
    ) -> Result<Option<NormalizedTrack>, PlatformError> {
        let developer_token = self.developer_token()?;
        let mut url = self.url(&format!("v1/catalog/{}/songs", self.config.storefront))?;
        url.query_pairs_mut().append_pair("filter[isrc]", isrc.trim());

        let page: SongPage = self
            .api
            .json("search_by_isrc", "catalog songs", |http| {
                http.get(url.clone())
                    .bearer_auth(developer_token)
                    .header("Music-User-Token", &ctx.access_token)
            })
            .await?;

        Ok(page.data.into_iter().find_map(Song::normalize))
    }

    async fn create_playlist(
        &self,
        _ctx: &AccessContext,
        _title: &str,
        _description: &str,
    ) -> Result<String, PlatformError> {
        Self::write_not_supported()
    }

    async fn add_tracks(
        &self,
        _ctx: &AccessContext,
        _playlist_id: &str,
        _track_ids: &[String],
    ) -> Result<(), PlatformError> {
        Self::write_not_supported()
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        Err(PlatformError::Auth {
            provider: PROVIDER,
            message: "music user tokens cannot be refreshed".to_string(),
        })
    }
}
