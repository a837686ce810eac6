//! Configuration loading for the playlist sync engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `PLAYLIST_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "PLAYLIST_SYNC_";

/// Application configuration derived from `PLAYLIST_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    /// Per-request timeout applied to every platform call.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_client_secret: Option<String>,
    #[serde(default = "default_spotify_api_base")]
    pub spotify_api_base: String,
    #[serde(default = "default_spotify_accounts_base")]
    pub spotify_accounts_base: String,
    #[serde(default = "default_deezer_api_base")]
    pub deezer_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apple_music_developer_token: Option<String>,
    #[serde(default = "default_apple_music_api_base")]
    pub apple_music_api_base: String,
    #[serde(default = "default_apple_music_storefront")]
    pub apple_music_storefront: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_api_key: Option<String>,
    #[serde(default = "default_youtube_api_base")]
    pub youtube_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_secret: Option<String>,
    #[serde(default = "default_google_token_url")]
    pub google_token_url: String,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub rate_limit_policy: RateLimitPolicyConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
    /// Paging limits keyed by provider slug.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paging: BTreeMap<String, PagingOverride>,
}

/// Dispatcher-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatcherConfig {
    #[serde(default = "default_dispatcher_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Maximum number of due playlists picked up per tick.
    #[serde(default = "default_dispatcher_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_dispatcher_jitter_pct_min")]
    pub jitter_pct_min: f64,
    #[serde(default = "default_dispatcher_jitter_pct_max")]
    pub jitter_pct_max: f64,
    /// Non-terminal jobs older than this are considered abandoned.
    #[serde(default = "default_dispatcher_stale_job_timeout_seconds")]
    pub stale_job_timeout_seconds: u64,
}

/// Rate limit policy shared by every platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitPolicyConfig {
    /// Total attempts per request, including the first one (default: 2)
    ///
    /// Environment variable: `PLAYLIST_SYNC_RATE_LIMIT_MAX_ATTEMPTS`
    #[serde(default = "default_rate_limit_max_attempts")]
    pub max_attempts: u32,

    /// Sleep used when the provider throttles without a retry-after hint (default: 1)
    ///
    /// Environment variable: `PLAYLIST_SYNC_RATE_LIMIT_DEFAULT_RETRY_AFTER_SECONDS`
    #[serde(default = "default_rate_limit_default_retry_after_seconds")]
    pub default_retry_after_seconds: u64,

    /// Upper bound on any single retry-after sleep (default: 60)
    ///
    /// Environment variable: `PLAYLIST_SYNC_RATE_LIMIT_MAX_RETRY_AFTER_SECONDS`
    #[serde(default = "default_rate_limit_max_retry_after_seconds")]
    pub max_retry_after_seconds: u64,

    /// Provider-specific overrides keyed by provider slug.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_overrides: BTreeMap<String, RateLimitProviderOverride>,
}

/// Provider-specific rate limit policy overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitProviderOverride {
    /// Environment variable: `PLAYLIST_SYNC_RATE_LIMIT_OVERRIDE_{PROVIDER}_DEFAULT_RETRY_AFTER_SECONDS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry_after_seconds: Option<u64>,

    /// Environment variable: `PLAYLIST_SYNC_RATE_LIMIT_OVERRIDE_{PROVIDER}_MAX_RETRY_AFTER_SECONDS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_after_seconds: Option<u64>,
}

/// Track matcher tuning.
///
/// The weights are defaults meant to be tuned against real catalog data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MatcherConfig {
    #[serde(default = "default_matcher_threshold")]
    pub threshold: f64,
    #[serde(default = "default_matcher_title_weight")]
    pub title_weight: f64,
    #[serde(default = "default_matcher_artist_weight")]
    pub artist_weight: f64,
    #[serde(default = "default_matcher_duration_weight")]
    pub duration_weight: f64,
    #[serde(default = "default_matcher_candidate_limit")]
    pub candidate_limit: u32,
    #[serde(default = "default_matcher_duration_tolerance_ms")]
    pub duration_tolerance_ms: u64,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OrchestratorConfig {
    /// Maximum number of in-flight match/write pipelines per job (default: 4)
    #[serde(default = "default_orchestrator_write_concurrency")]
    pub write_concurrency: usize,
    /// Description used when the destination playlist has to be created.
    #[serde(default = "default_orchestrator_playlist_description")]
    pub playlist_description: String,
}

/// Lowers an adapter's page size or write batch size below the provider maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PagingOverride {
    /// Environment variable: `PLAYLIST_SYNC_PAGING_{PROVIDER}_PAGE_SIZE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Environment variable: `PLAYLIST_SYNC_PAGING_{PROVIDER}_WRITE_BATCH_SIZE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_batch_size: Option<usize>,
}

/// Token refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Tokens expiring within this window are refreshed before use (default: 120)
    #[serde(default = "default_token_refresh_lead_time_seconds")]
    pub lead_time_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            spotify_client_id: None,
            spotify_client_secret: None,
            spotify_api_base: default_spotify_api_base(),
            spotify_accounts_base: default_spotify_accounts_base(),
            deezer_api_base: default_deezer_api_base(),
            apple_music_developer_token: None,
            apple_music_api_base: default_apple_music_api_base(),
            apple_music_storefront: default_apple_music_storefront(),
            youtube_api_key: None,
            youtube_api_base: default_youtube_api_base(),
            google_client_id: None,
            google_client_secret: None,
            google_token_url: default_google_token_url(),
            dispatcher: DispatcherConfig::default(),
            rate_limit_policy: RateLimitPolicyConfig::default(),
            matcher: MatcherConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            token_refresh: TokenRefreshConfig::default(),
            paging: BTreeMap::new(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_dispatcher_tick_interval_seconds(),
            batch_size: default_dispatcher_batch_size(),
            jitter_pct_min: default_dispatcher_jitter_pct_min(),
            jitter_pct_max: default_dispatcher_jitter_pct_max(),
            stale_job_timeout_seconds: default_dispatcher_stale_job_timeout_seconds(),
        }
    }
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_rate_limit_max_attempts(),
            default_retry_after_seconds: default_rate_limit_default_retry_after_seconds(),
            max_retry_after_seconds: default_rate_limit_max_retry_after_seconds(),
            provider_overrides: BTreeMap::new(),
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: default_matcher_threshold(),
            title_weight: default_matcher_title_weight(),
            artist_weight: default_matcher_artist_weight(),
            duration_weight: default_matcher_duration_weight(),
            candidate_limit: default_matcher_candidate_limit(),
            duration_tolerance_ms: default_matcher_duration_tolerance_ms(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            write_concurrency: default_orchestrator_write_concurrency(),
            playlist_description: default_orchestrator_playlist_description(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            lead_time_seconds: default_token_refresh_lead_time_seconds(),
        }
    }
}

impl AppConfig {
    /// Returns a pretty-printed JSON representation with secrets redacted.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        for secret in [
            &mut config.spotify_client_id,
            &mut config.spotify_client_secret,
            &mut config.apple_music_developer_token,
            &mut config.youtube_api_key,
            &mut config.google_client_id,
            &mut config.google_client_secret,
        ] {
            if secret.is_some() {
                *secret = Some("[REDACTED]".to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Paging limits configured for a provider; empty when none are set.
    pub fn paging_for(&self, provider: &str) -> PagingOverride {
        self.paging.get(provider).copied().unwrap_or_default()
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref key) = self.crypto_key {
            if key.len() != 32 {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
        } else {
            return Err(ConfigError::MissingCryptoKey);
        }

        // Provider client credentials are only mandatory outside local/test
        if !matches!(self.profile.as_str(), "local" | "test") {
            if self.spotify_client_id.is_none() {
                return Err(ConfigError::MissingSpotifyClientId);
            }
            if self.spotify_client_secret.is_none() {
                return Err(ConfigError::MissingSpotifyClientSecret);
            }
        }

        if self.http_timeout_seconds == 0 || self.http_timeout_seconds > 60 {
            return Err(ConfigError::InvalidHttpTimeout {
                value: self.http_timeout_seconds,
            });
        }

        self.dispatcher.validate()?;
        self.rate_limit_policy.validate()?;
        self.matcher.validate()?;
        self.orchestrator.validate()?;

        for (provider, limits) in &self.paging {
            if limits.page_size == Some(0) || limits.write_batch_size == Some(0) {
                return Err(ConfigError::InvalidPagingSize {
                    provider: provider.clone(),
                });
            }
        }

        Ok(())
    }
}

impl DispatcherConfig {
    /// Validate dispatcher configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 5 || self.tick_interval_seconds > 3600 {
            return Err(ConfigError::InvalidDispatcherTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidDispatcherBatchSize {
                value: self.batch_size,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_pct_min) {
            return Err(ConfigError::InvalidDispatcherJitterRange {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
                field: "minimum percentage".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_pct_max) {
            return Err(ConfigError::InvalidDispatcherJitterRange {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
                field: "maximum percentage".to_string(),
            });
        }
        if self.jitter_pct_min > self.jitter_pct_max {
            return Err(ConfigError::InvalidDispatcherJitterInverted {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
            });
        }
        if self.stale_job_timeout_seconds < 60 {
            return Err(ConfigError::InvalidStaleJobTimeout {
                value: self.stale_job_timeout_seconds,
            });
        }
        Ok(())
    }
}

impl RateLimitPolicyConfig {
    /// Validate rate limit policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > 5 {
            return Err(ConfigError::InvalidRateLimitAttempts {
                value: self.max_attempts,
            });
        }

        if self.default_retry_after_seconds > self.max_retry_after_seconds {
            return Err(ConfigError::InvalidRateLimitBounds {
                default: self.default_retry_after_seconds,
                max: self.max_retry_after_seconds,
            });
        }

        for (provider, override_config) in &self.provider_overrides {
            let default = override_config
                .default_retry_after_seconds
                .unwrap_or(self.default_retry_after_seconds);
            let max = override_config
                .max_retry_after_seconds
                .unwrap_or(self.max_retry_after_seconds);

            if default > max {
                return Err(ConfigError::InvalidRateLimitProviderBounds {
                    provider: provider.clone(),
                    default,
                    max,
                });
            }
        }

        Ok(())
    }

    /// Effective `(default_retry_after, max_retry_after)` for a provider.
    pub fn for_provider(&self, provider: &str) -> (u64, u64) {
        match self.provider_overrides.get(provider) {
            Some(o) => (
                o.default_retry_after_seconds
                    .unwrap_or(self.default_retry_after_seconds),
                o.max_retry_after_seconds
                    .unwrap_or(self.max_retry_after_seconds),
            ),
            None => (
                self.default_retry_after_seconds,
                self.max_retry_after_seconds,
            ),
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::InvalidMatcherThreshold {
                value: self.threshold,
            });
        }
        let weights = [self.title_weight, self.artist_weight, self.duration_weight];
        if weights.iter().any(|w| *w < 0.0) {
            return Err(ConfigError::InvalidMatcherWeights {
                sum: weights.iter().sum(),
            });
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidMatcherWeights { sum });
        }
        if self.candidate_limit == 0 || self.candidate_limit > 50 {
            return Err(ConfigError::InvalidMatcherCandidateLimit {
                value: self.candidate_limit,
            });
        }
        Ok(())
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_concurrency == 0 || self.write_concurrency > 8 {
            return Err(ConfigError::InvalidWriteConcurrency {
                value: self.write_concurrency,
            });
        }
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://playlist_sync@localhost:5432/playlist_sync".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_http_timeout_seconds() -> u64 {
    20
}

fn default_spotify_api_base() -> String {
    "https://api.spotify.com/v1".to_string()
}

fn default_spotify_accounts_base() -> String {
    "https://accounts.spotify.com".to_string()
}

fn default_deezer_api_base() -> String {
    "https://api.deezer.com".to_string()
}

fn default_apple_music_api_base() -> String {
    "https://api.music.apple.com".to_string()
}

fn default_apple_music_storefront() -> String {
    "us".to_string()
}

fn default_youtube_api_base() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_dispatcher_tick_interval_seconds() -> u64 {
    60 // 1 minute
}

fn default_dispatcher_batch_size() -> u64 {
    50
}

fn default_dispatcher_jitter_pct_min() -> f64 {
    0.0
}

fn default_dispatcher_jitter_pct_max() -> f64 {
    0.05 // 5% of the sync interval
}

fn default_dispatcher_stale_job_timeout_seconds() -> u64 {
    7200 // 2 hours
}

fn default_rate_limit_max_attempts() -> u32 {
    2 // first attempt plus exactly one retry
}

fn default_rate_limit_default_retry_after_seconds() -> u64 {
    1
}

fn default_rate_limit_max_retry_after_seconds() -> u64 {
    60
}

fn default_matcher_threshold() -> f64 {
    0.75
}

fn default_matcher_title_weight() -> f64 {
    0.45
}

fn default_matcher_artist_weight() -> f64 {
    0.35
}

fn default_matcher_duration_weight() -> f64 {
    0.20
}

fn default_matcher_candidate_limit() -> u32 {
    5
}

fn default_matcher_duration_tolerance_ms() -> u64 {
    10_000
}

fn default_orchestrator_write_concurrency() -> usize {
    4
}

fn default_orchestrator_playlist_description() -> String {
    "Created with playlist-sync".to_string()
}

fn default_token_refresh_lead_time_seconds() -> u64 {
    120
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("crypto key is missing; set PLAYLIST_SYNC_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("Spotify client ID is missing; set PLAYLIST_SYNC_SPOTIFY_CLIENT_ID")]
    MissingSpotifyClientId,
    #[error("Spotify client secret is missing; set PLAYLIST_SYNC_SPOTIFY_CLIENT_SECRET")]
    MissingSpotifyClientSecret,
    #[error("http timeout must be between 1 and 60 seconds, got {value}")]
    InvalidHttpTimeout { value: u64 },
    #[error("dispatcher tick interval must be between 5 and 3600 seconds, got {value}")]
    InvalidDispatcherTickInterval { value: u64 },
    #[error("dispatcher batch size must be positive, got {value}")]
    InvalidDispatcherBatchSize { value: u64 },
    #[error("dispatcher jitter percentage {field} is out of bounds (min: {min}, max: {max})")]
    InvalidDispatcherJitterRange { min: f64, max: f64, field: String },
    #[error("dispatcher jitter percentage minimum ({min}) cannot be greater than maximum ({max})")]
    InvalidDispatcherJitterInverted { min: f64, max: f64 },
    #[error("stale job timeout must be at least 60 seconds, got {value}")]
    InvalidStaleJobTimeout { value: u64 },
    #[error("rate limit max attempts must be between 1 and 5, got {value}")]
    InvalidRateLimitAttempts { value: u32 },
    #[error("rate limit default retry-after ({default}) cannot exceed the maximum ({max})")]
    InvalidRateLimitBounds { default: u64, max: u64 },
    #[error(
        "provider {provider} rate limit default retry-after ({default}) cannot exceed the maximum ({max})"
    )]
    InvalidRateLimitProviderBounds {
        provider: String,
        default: u64,
        max: u64,
    },
    #[error("matcher threshold must be between 0.0 and 1.0, got {value}")]
    InvalidMatcherThreshold { value: f64 },
    #[error("matcher weights must be non-negative and sum to 1.0, got {sum}")]
    InvalidMatcherWeights { sum: f64 },
    #[error("matcher candidate limit must be between 1 and 50, got {value}")]
    InvalidMatcherCandidateLimit { value: u32 },
    #[error("orchestrator write concurrency must be between 1 and 8, got {value}")]
    InvalidWriteConcurrency { value: usize },
    #[error("paging sizes for provider {provider} must be positive")]
    InvalidPagingSize { provider: String },
}

/// Loads configuration using layered `.env` files and `PLAYLIST_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`
    /// and finally the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = non_empty(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = non_empty(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            non_empty(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = parsed(&mut layered, "DB_MAX_CONNECTIONS")
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let crypto_key = match layered.remove("CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(
                    general_purpose::STANDARD
                        .decode(key_str.trim())
                        .map_err(|e| ConfigError::InvalidCryptoKeyBase64 {
                            error: e.to_string(),
                        })?,
                )
            }
            None => None,
        };

        let http_timeout_seconds = parsed(&mut layered, "HTTP_TIMEOUT_SECONDS")
            .unwrap_or_else(default_http_timeout_seconds);

        let spotify_client_id = non_empty(&mut layered, "SPOTIFY_CLIENT_ID");
        let spotify_client_secret = non_empty(&mut layered, "SPOTIFY_CLIENT_SECRET");
        let spotify_api_base =
            non_empty(&mut layered, "SPOTIFY_API_BASE").unwrap_or_else(default_spotify_api_base);
        let spotify_accounts_base = non_empty(&mut layered, "SPOTIFY_ACCOUNTS_BASE")
            .unwrap_or_else(default_spotify_accounts_base);
        let deezer_api_base =
            non_empty(&mut layered, "DEEZER_API_BASE").unwrap_or_else(default_deezer_api_base);
        let apple_music_developer_token = non_empty(&mut layered, "APPLE_MUSIC_DEVELOPER_TOKEN");
        let apple_music_api_base = non_empty(&mut layered, "APPLE_MUSIC_API_BASE")
            .unwrap_or_else(default_apple_music_api_base);
        let apple_music_storefront = non_empty(&mut layered, "APPLE_MUSIC_STOREFRONT")
            .unwrap_or_else(default_apple_music_storefront);
        let youtube_api_key = non_empty(&mut layered, "YOUTUBE_API_KEY");
        let youtube_api_base =
            non_empty(&mut layered, "YOUTUBE_API_BASE").unwrap_or_else(default_youtube_api_base);
        let google_client_id = non_empty(&mut layered, "GOOGLE_CLIENT_ID");
        let google_client_secret = non_empty(&mut layered, "GOOGLE_CLIENT_SECRET");
        let google_token_url =
            non_empty(&mut layered, "GOOGLE_TOKEN_URL").unwrap_or_else(default_google_token_url);

        let dispatcher = DispatcherConfig {
            tick_interval_seconds: parsed(&mut layered, "DISPATCHER_TICK_INTERVAL_SECONDS")
                .unwrap_or_else(default_dispatcher_tick_interval_seconds),
            batch_size: parsed(&mut layered, "DISPATCHER_BATCH_SIZE")
                .unwrap_or_else(default_dispatcher_batch_size),
            jitter_pct_min: parsed(&mut layered, "DISPATCHER_JITTER_PCT_MIN")
                .unwrap_or_else(default_dispatcher_jitter_pct_min),
            jitter_pct_max: parsed(&mut layered, "DISPATCHER_JITTER_PCT_MAX")
                .unwrap_or_else(default_dispatcher_jitter_pct_max),
            stale_job_timeout_seconds: parsed(&mut layered, "DISPATCHER_STALE_JOB_TIMEOUT_SECONDS")
                .unwrap_or_else(default_dispatcher_stale_job_timeout_seconds),
        };

        let mut provider_overrides: BTreeMap<String, RateLimitProviderOverride> = BTreeMap::new();
        for (key, value) in layered.clone() {
            // Expected format: RATE_LIMIT_OVERRIDE_<PROVIDER>_<SETTING>
            let Some(suffix) = key.strip_prefix("RATE_LIMIT_OVERRIDE_") else {
                continue;
            };
            let setting = if suffix.ends_with("_DEFAULT_RETRY_AFTER_SECONDS") {
                "_DEFAULT_RETRY_AFTER_SECONDS"
            } else if suffix.ends_with("_MAX_RETRY_AFTER_SECONDS") {
                "_MAX_RETRY_AFTER_SECONDS"
            } else {
                continue;
            };
            let provider = suffix.trim_end_matches(setting).to_lowercase();
            let Ok(seconds) = value.parse::<u64>() else {
                continue;
            };
            let entry = provider_overrides.entry(provider).or_default();
            if setting == "_DEFAULT_RETRY_AFTER_SECONDS" {
                entry.default_retry_after_seconds = Some(seconds);
            } else {
                entry.max_retry_after_seconds = Some(seconds);
            }
        }

        let mut paging: BTreeMap<String, PagingOverride> = BTreeMap::new();
        for (key, value) in layered.clone() {
            // Expected format: PAGING_<PROVIDER>_<SETTING>
            let Some(suffix) = key.strip_prefix("PAGING_") else {
                continue;
            };
            let (provider, is_batch) = if let Some(p) = suffix.strip_suffix("_WRITE_BATCH_SIZE") {
                (p, true)
            } else if let Some(p) = suffix.strip_suffix("_PAGE_SIZE") {
                (p, false)
            } else {
                continue;
            };
            let Ok(size) = value.trim().parse::<usize>() else {
                continue;
            };
            let entry = paging.entry(provider.to_lowercase()).or_default();
            if is_batch {
                entry.write_batch_size = Some(size);
            } else {
                entry.page_size = Some(size);
            }
        }

        let rate_limit_policy = RateLimitPolicyConfig {
            max_attempts: parsed(&mut layered, "RATE_LIMIT_MAX_ATTEMPTS")
                .unwrap_or_else(default_rate_limit_max_attempts),
            default_retry_after_seconds: parsed(
                &mut layered,
                "RATE_LIMIT_DEFAULT_RETRY_AFTER_SECONDS",
            )
            .unwrap_or_else(default_rate_limit_default_retry_after_seconds),
            max_retry_after_seconds: parsed(&mut layered, "RATE_LIMIT_MAX_RETRY_AFTER_SECONDS")
                .unwrap_or_else(default_rate_limit_max_retry_after_seconds),
            provider_overrides,
        };

        let matcher = MatcherConfig {
            threshold: parsed(&mut layered, "MATCHER_THRESHOLD")
                .unwrap_or_else(default_matcher_threshold),
            title_weight: parsed(&mut layered, "MATCHER_TITLE_WEIGHT")
                .unwrap_or_else(default_matcher_title_weight),
            artist_weight: parsed(&mut layered, "MATCHER_ARTIST_WEIGHT")
                .unwrap_or_else(default_matcher_artist_weight),
            duration_weight: parsed(&mut layered, "MATCHER_DURATION_WEIGHT")
                .unwrap_or_else(default_matcher_duration_weight),
            candidate_limit: parsed(&mut layered, "MATCHER_CANDIDATE_LIMIT")
                .unwrap_or_else(default_matcher_candidate_limit),
            duration_tolerance_ms: parsed(&mut layered, "MATCHER_DURATION_TOLERANCE_MS")
                .unwrap_or_else(default_matcher_duration_tolerance_ms),
        };

        let orchestrator = OrchestratorConfig {
            write_concurrency: parsed(&mut layered, "ORCHESTRATOR_WRITE_CONCURRENCY")
                .unwrap_or_else(default_orchestrator_write_concurrency),
            playlist_description: non_empty(&mut layered, "ORCHESTRATOR_PLAYLIST_DESCRIPTION")
                .unwrap_or_else(default_orchestrator_playlist_description),
        };

        let token_refresh = TokenRefreshConfig {
            lead_time_seconds: parsed(&mut layered, "TOKEN_REFRESH_LEAD_TIME_SECONDS")
                .unwrap_or_else(default_token_refresh_lead_time_seconds),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            crypto_key,
            http_timeout_seconds,
            spotify_client_id,
            spotify_client_secret,
            spotify_api_base,
            spotify_accounts_base,
            deezer_api_base,
            apple_music_developer_token,
            apple_music_api_base,
            apple_music_storefront,
            youtube_api_key,
            youtube_api_base,
            google_client_id,
            google_client_secret,
            google_token_url,
            dispatcher,
            rate_limit_policy,
            matcher,
            orchestrator,
            token_refresh,
            paging,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();
        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;
        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;
        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    layered.remove(key).and_then(|v| v.trim().parse().ok())
}
