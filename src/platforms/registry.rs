//! Platform registry
//!
//! Holds one adapter per provider together with its metadata. Built once from
//! configuration and passed to the components that need it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::apple_music::{AppleMusicAdapter, AppleMusicConfig};
use super::deezer::{DeezerAdapter, DeezerConfig};
use super::http::{ApiClient, build_client};
use super::metadata::PlatformMetadata;
use super::retry::RetryPolicy;
use super::spotify::{SpotifyAdapter, SpotifyConfig};
use super::trait_::PlatformAdapter;
use super::youtube::{YoutubeAdapter, YoutubeConfig};
use crate::config::AppConfig;
use crate::models::connection::Provider;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{provider}' not registered")]
    ProviderNotFound { provider: Provider },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Adapters keyed by provider
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    adapters: HashMap<Provider, Arc<dyn PlatformAdapter>>,
    metadata: HashMap<Provider, PlatformMetadata>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every supported provider using the configured endpoints,
    /// credentials, timeout and retry policy.
    pub fn from_config(config: &AppConfig) -> Result<Self, RegistryError> {
        let http = build_client(Duration::from_secs(config.http_timeout_seconds))?;
        let api = |provider: Provider| {
            ApiClient::new(
                provider,
                http.clone(),
                RetryPolicy::from_config(provider, &config.rate_limit_policy),
            )
        };

        let spotify = config.paging_for(Provider::Spotify.as_str());
        let deezer = config.paging_for(Provider::Deezer.as_str());
        let apple_music = config.paging_for(Provider::AppleMusic.as_str());
        let youtube = config.paging_for(Provider::Youtube.as_str());

        let mut registry = Self::new();

        if config.spotify_client_id.is_none() || config.spotify_client_secret.is_none() {
            warn!("Spotify client credentials missing: token refresh will fail");
        }
        registry.register(
            Arc::new(SpotifyAdapter::new(
                SpotifyConfig {
                    api_base: config.spotify_api_base.clone(),
                    accounts_base: config.spotify_accounts_base.clone(),
                    client_id: config.spotify_client_id.clone(),
                    client_secret: config.spotify_client_secret.clone(),
                },
                api(Provider::Spotify),
            )
            .with_limits(spotify.page_size, spotify.write_batch_size)),
            SpotifyAdapter::metadata(),
        );

        registry.register(
            Arc::new(DeezerAdapter::new(
                DeezerConfig {
                    api_base: config.deezer_api_base.clone(),
                },
                api(Provider::Deezer),
            )
            .with_limits(deezer.page_size, deezer.write_batch_size)),
            DeezerAdapter::metadata(),
        );

        if config.apple_music_developer_token.is_none() {
            warn!("Apple Music developer token missing: Apple Music calls will fail");
        }
        registry.register(
            Arc::new(AppleMusicAdapter::new(
                AppleMusicConfig {
                    api_base: config.apple_music_api_base.clone(),
                    developer_token: config.apple_music_developer_token.clone(),
                    storefront: config.apple_music_storefront.clone(),
                },
                api(Provider::AppleMusic),
            )
            .with_limits(apple_music.page_size)),
            AppleMusicAdapter::metadata(),
        );

        registry.register(
            Arc::new(YoutubeAdapter::new(
                YoutubeConfig {
                    api_base: config.youtube_api_base.clone(),
                    api_key: config.youtube_api_key.clone(),
                    token_url: config.google_token_url.clone(),
                    client_id: config.google_client_id.clone(),
                    client_secret: config.google_client_secret.clone(),
                },
                api(Provider::Youtube),
            )
            .with_limits(youtube.page_size, youtube.write_batch_size)),
            YoutubeAdapter::metadata(),
        );

        Ok(registry)
    }

    /// Registers an adapter, replacing any previous one for the provider.
    /// The stored metadata reports the adapter's effective capabilities.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>, mut metadata: PlatformMetadata) {
        let provider = adapter.provider();
        metadata.capabilities = adapter.capabilities();
        self.adapters.insert(provider, adapter);
        self.metadata.insert(provider, metadata);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn PlatformAdapter>, RegistryError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(RegistryError::ProviderNotFound { provider })
    }

    /// Metadata for all registered providers, sorted for stable ordering
    pub fn list_metadata(&self) -> Vec<PlatformMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by_key(|m| m.provider);
        metadata
    }

    pub fn get_metadata(&self, provider: Provider) -> Result<&PlatformMetadata, RegistryError> {
        self.metadata
            .get(&provider)
            .ok_or(RegistryError::ProviderNotFound { provider })
    }
}
