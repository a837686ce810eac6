//! YouTube Data API v3 adapter
//!
//! Playlist items are videos; the artist is taken from the uploading channel.
//! Google reports quota exhaustion as a 403, which the shared HTTP layer maps
//! to a rate limit.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::http::ApiClient;
use super::metadata::{AuthType, PlatformCapabilities, PlatformMetadata};
use super::trait_::{AccessContext, NormalizedTrack, PlatformAdapter, PlatformError, TokenGrant};
use crate::models::connection::Provider;

const PROVIDER: Provider = Provider::Youtube;
const PAGE_SIZE: usize = 50;
const WRITE_BATCH_SIZE: usize = 1;
const TOPIC_SUFFIX: &str = " - Topic";

pub const YOUTUBE_SCOPES: &[&str] = &["https://www.googleapis.com/auth/youtube"];

#[derive(Debug, Clone)]
pub struct YoutubeConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemSnippet {
    #[serde(default)]
    title: String,
    video_owner_channel_title: Option<String>,
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentDetails {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: Option<ItemSnippet>,
    content_details: Option<ContentDetails>,
}

impl PlaylistItem {
    /// Deleted and private videos have no owner channel; they are skipped.
    fn normalize(self) -> Option<NormalizedTrack> {
        let snippet = self.snippet?;
        let channel = snippet.video_owner_channel_title?;
        let video_id = self
            .content_details
            .and_then(|d| d.video_id)
            .or_else(|| snippet.resource_id.and_then(|r| r.video_id))?;
        Some(video_track(video_id, snippet.title, &channel))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel_title: String,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
    snippet: Option<SearchSnippet>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct CreatedPlaylist {
    id: String,
}

fn video_track(video_id: String, title: String, channel: &str) -> NormalizedTrack {
    NormalizedTrack {
        provider_track_id: video_id,
        title,
        artist: channel
            .strip_suffix(TOPIC_SUFFIX)
            .unwrap_or(channel)
            .to_string(),
        album: None,
        duration_ms: None,
        isrc: None,
    }
}

pub struct YoutubeAdapter {
    config: YoutubeConfig,
    api: ApiClient,
    capabilities: PlatformCapabilities,
}

impl YoutubeAdapter {
    pub fn new(config: YoutubeConfig, api: ApiClient) -> Self {
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
            YOUTUBE_SCOPES.iter().map(|s| s.to_string()).collect(),
            Self::static_capabilities(),
        )
    }

    fn static_capabilities() -> PlatformCapabilities {
        PlatformCapabilities {
            can_read: true,
            can_write: true,
            can_export: true,
            can_remove: false,
            write_batch_size: WRITE_BATCH_SIZE,
            page_size: PAGE_SIZE,
        }
    }

    fn url(&self, path: &str) -> Result<Url, PlatformError> {
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
        if let Some(key) = &self.config.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }
}

#[async_trait]
impl PlatformAdapter for YoutubeAdapter {
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
        let mut tracks = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url("playlistItems")?;
            url.query_pairs_mut()
                .append_pair("part", "snippet,contentDetails")
                .append_pair("maxResults", &self.capabilities.page_size.to_string())
                .append_pair("playlistId", playlist_id);
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let page: PlaylistItemsPage = self
                .api
                .json("fetch_playlist_tracks", &resource, |http| {
                    http.get(url.clone()).bearer_auth(&ctx.access_token)
                })
                .await?;

            tracks.extend(page.items.into_iter().filter_map(PlaylistItem::normalize));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(playlist_id, count = tracks.len(), "fetched youtube playlist");
        Ok(tracks)
    }

    async fn search_track(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError> {
        let mut url = self.url("search")?;
        url.query_pairs_mut()
            .append_pair("part", "snippet")
            .append_pair("type", "video")
            .append_pair("videoCategoryId", "10")
            .append_pair("q", query)
            .append_pair("maxResults", &limit.clamp(1, 50).to_string());

        let response: SearchResponse = self
            .api
            .json("search_track", "search", |http| {
                http.get(url.clone()).bearer_auth(&ctx.access_token)
            })
            .await?;

        Ok(response
            .items
            .into_iter()
            .filter_map(|item| {
                let video_id = item.id.video_id?;
                let snippet = item.snippet?;
                Some(video_track(video_id, snippet.title, &snippet.channel_title))
            })
            .collect())
    }

    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        title: &str,
        description: &str,
    ) -> Result<String, PlatformError> {
        let mut url = self.url("playlists")?;
        url.query_pairs_mut().append_pair("part", "snippet,status");
        let body = json!({
            "snippet": { "title": title, "description": description },
            "status": { "privacyStatus": "private" },
        });

        let created: CreatedPlaylist = self
            .api
            .json("create_playlist", "playlists", |http| {
                http.post(url.clone())
                    .bearer_auth(&ctx.access_token)
                    .json(&body)
            })
            .await?;

        info!(playlist_id = %created.id, "created youtube playlist");
        Ok(created.id)
    }

    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError> {
        let resource = format!("playlist {}", playlist_id);
        let mut url = self.url("playlistItems")?;
        url.query_pairs_mut().append_pair("part", "snippet");

        for video_id in track_ids {
            let body = json!({
                "snippet": {
                    "playlistId": playlist_id,
                    "resourceId": { "kind": "youtube#video", "videoId": video_id },
                }
            });
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

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let (Some(client_id), Some(client_secret)) =
            (&self.config.client_id, &self.config.client_secret)
        else {
            return Err(PlatformError::Auth {
                provider: PROVIDER,
                message: "google client credentials are not configured".to_string(),
            });
        };

        let form = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let result: Result<TokenGrant, PlatformError> = self
            .api
            .json("refresh_access_token", "token", |http| {
                http.post(&self.config.token_url).form(&form)
            })
            .await;

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_channels_lose_suffix() {
        let track = video_track("abc".into(), "Song 2".into(), "Blur - Topic");
        assert_eq!(track.artist, "Blur");
        assert_eq!(track.duration_ms, None);
    }

    #[test]
    fn deleted_videos_are_skipped() {
        let item: PlaylistItem = serde_json::from_value(json!({
            "snippet": { "title": "Deleted video", "resourceId": { "videoId": "gone" } },
            "contentDetails": { "videoId": "gone" }
        }))
        .unwrap();
        assert!(item.normalize().is_none());
    }
}
