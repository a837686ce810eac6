//! Spotify Web API adapter
//!
//! Reads and writes playlists through the Web API with OAuth2 bearer tokens.
//! Track identifiers are Spotify URIs (`spotify:track:...`), which is what the
//! playlist write endpoints accept.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::http::ApiClient;
use super::metadata::{AuthType, PlatformCapabilities, PlatformMetadata};
use super::trait_::{AccessContext, NormalizedTrack, PlatformAdapter, PlatformError, TokenGrant};
use crate::models::connection::Provider;

const PROVIDER: Provider = Provider::Spotify;
const PAGE_SIZE: usize = 100;
const WRITE_BATCH_SIZE: usize = 100;
const TRACK_FIELDS: &str =
    "next,items(track(id,uri,name,duration_ms,artists(name),album(name),external_ids(isrc)))";

pub const SPOTIFY_SCOPES: &[&str] = &[
    "playlist-read-private",
    "playlist-modify-private",
    "playlist-modify-public",
];

#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub api_base: String,
    pub accounts_base: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SpotifyExternalIds {
    isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    uri: Option<String>,
    name: Option<String>,
    duration_ms: Option<u64>,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    album: Option<SpotifyAlbum>,
    #[serde(default)]
    external_ids: Option<SpotifyExternalIds>,
}

impl SpotifyTrack {
    /// Local files and removed tracks come back without a URI; they cannot be
    /// synced anywhere.
    fn normalize(self) -> Option<NormalizedTrack> {
        let uri = self.uri?;
        Some(NormalizedTrack {
            provider_track_id: uri,
            title: self.name.unwrap_or_default(),
            artist: self
                .artists
                .into_iter()
                .map(|a| a.name)
                .collect::<Vec<_>>()
                .join(", "),
            album: self.album.and_then(|a| a.name),
            duration_ms: self.duration_ms,
            isrc: self.external_ids.and_then(|ids| ids.isrc),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracksPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchTracks {
    #[serde(default)]
    items: Vec<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: Option<SearchTracks>,
}

#[derive(Debug, Deserialize)]
struct CreatedPlaylist {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    id: String,
}

pub struct SpotifyAdapter {
    config: SpotifyConfig,
    api: ApiClient,
    capabilities: PlatformCapabilities,
}

impl SpotifyAdapter {
    pub fn new(config: SpotifyConfig, api: ApiClient) -> Self {
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
            AuthType::OAuth2,
            SPOTIFY_SCOPES.iter().map(|s| s.to_string()).collect(),
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

    async fn search(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        let mut url = self.url("search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("type", "track")
            .append_pair("limit", &limit.clamp(1, 50).to_string());

        let response: SearchResponse = self
            .api
            .json("search_track", "search", |http| {
                http.get(url.clone()).bearer_auth(&ctx.access_token)
            })
            .await?;

        Ok(response
            .tracks
            .map(|t| t.items)
            .unwrap_or_default()
            .into_iter()
            .filter_map(SpotifyTrack::normalize)
            .collect())
    }

    async fn user_id(&self, ctx: &AccessContext) -> Result<String, PlatformError> {
        if let Some(id) = &ctx.provider_user_id {
            return Ok(id.clone());
        }
        let url = self.url("me")?;
        let me: CurrentUser = self
            .api
            .json("current_user", "current user", |http| {
                http.get(url.clone()).bearer_auth(&ctx.access_token)
            })
            .await?;
        Ok(me.id)
    }
}

#[async_trait]
impl PlatformAdapter for SpotifyAdapter {
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
        let mut url = self.url(&format!("playlists/{}/tracks", playlist_id))?;
        url.query_pairs_mut()
            .append_pair("limit", &self.capabilities.page_size.to_string())
            .append_pair("fields", TRACK_FIELDS);

        let mut tracks = Vec::new();
        let mut next = Some(url);
        while let Some(page_url) = next.take() {
            let page: PlaylistTracksPage = self
                .api
                .json("fetch_playlist_tracks", &resource, |http| {
                    http.get(page_url.clone()).bearer_auth(&ctx.access_token)
                })
                .await?;

            tracks.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| item.track)
                    .filter_map(SpotifyTrack::normalize),
            );

            next = match page.next {
                Some(link) => Some(Url::parse(&link).map_err(|e| {
                    PlatformError::MalformedResponse {
                        provider: PROVIDER,
                        message: format!("invalid next link: {}", e),
                    }
                })?),
                None => None,
            };
        }

        debug!(playlist_id, count = tracks.len(), "fetched spotify playlist");
        Ok(tracks)
    }

    async fn search_track(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        self.search(ctx, query, limit).await
    }

    async fn search_by_isrc(
        &self,
        ctx: &AccessContext,
        isrc: &str,
    ) -> Result<Option<NormalizedTrack>, PlatformError> {
        let found = self.search(ctx, &format!("isrc:{}", isrc.trim()), 1).await?;
        Ok(found.into_iter().next())
    }

    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        title: &str,
        description: &str,
    ) -> Result<String, PlatformError> {
        let user_id = self.user_id(ctx).await?;
        let url = self.url(&format!("users/{}/playlists", user_id))?;
        let body = json!({
            "name": title,
            "description": description,
            "public": false,
        });

        let created: CreatedPlaylist = self
            .api
            .json("create_playlist", "user playlists", |http| {
                http.post(url.clone())
                    .bearer_auth(&ctx.access_token)
                    .json(&body)
            })
            .await?;

        info!(playlist_id = %created.id, "created spotify playlist");
        Ok(created.id)
    }

    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        let resource = format!("playlist {}", playlist_id);
        let url = self.url(&format!("playlists/{}/tracks", playlist_id))?;
        for batch in track_ids.chunks(self.capabilities.write_batch_size) {
            let body = json!({ "uris": batch });
            self.api
                .execute("add_tracks", &resource, |http| {
                    http.post(url.clone())
                        .bearer_auth(&ctx.access_token)
                        .json(&body)
                })
                .await?;
        }
        Ok(())
    }

    async fn remove_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        let resource = format!("playlist {}", playlist_id);
        let url = self.url(&format!("playlists/{}/tracks", playlist_id))?;
        for batch in track_ids.chunks(self.capabilities.write_batch_size) {
            let tracks: Vec<_> = batch.iter().map(|uri| json!({ "uri": uri })).collect();
            let body = json!({ "tracks": tracks });
            self.api
                .execute("remove_tracks", &resource, |http| {
                    http.delete(url.clone())
                        .bearer_auth(&ctx.access_token)
                        .json(&body)
                })
                .await?;
        }
        Ok(())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let (Some(client_id), Some(client_secret)) =
            (&self.config.client_id, &self.config.client_secret)
        else {
            return Err(PlatformError::Auth {
                provider: PROVIDER,
                message: "spotify client credentials are not configured".to_string(),
            });
        };

        let token_url = format!(
            "{}/api/token",
            self.config.accounts_base.trim_end_matches('/')
        );
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let result: Result<TokenGrant, PlatformError> = self
            .api
            .json("refresh_access_token", "token", |http| {
                http.post(&token_url)
                    .basic_auth(client_id, Some(client_secret))
                    .form(&form)
            })
            .await;

        // invalid_grant comes back as 400; the refresh token is dead
        result.map_err(|err| match err {
            PlatformError::Permanent {
                status: 400,
                message,
                ..
            } => PlatformError::Auth {
                provider: PROVIDER,
                message,
            },
            other => other,
        })
    }
}
