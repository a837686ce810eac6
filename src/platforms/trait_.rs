//! Platform adapter trait definition
//!
//! Defines the uniform surface every streaming provider implements, along with
//! the normalized track shape and the adapter error taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::metadata::PlatformCapabilities;
use crate::models::connection::Provider;

/// Errors surfaced by platform adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Token invalid or expired; the caller refreshes and retries once
    #[error("{provider} rejected the credentials: {message}")]
    Auth { provider: Provider, message: String },

    #[error("{provider} rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimited {
        provider: Provider,
        retry_after_secs: u64,
    },

    /// Playlist (or other resource) no longer exists or is private
    #[error("{provider} resource not found: {resource}")]
    NotFound { provider: Provider, resource: String },

    #[error("{provider} does not support writing playlists")]
    WriteNotSupported { provider: Provider },

    #[error("request to {provider} timed out")]
    Timeout { provider: Provider },

    /// Network failures and 5xx responses
    #[error("{provider} transient failure: {message}")]
    Transient { provider: Provider, message: String },

    /// Non-retryable 4xx responses
    #[error("{provider} request failed with status {status}: {message}")]
    Permanent {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("malformed {provider} response: {message}")]
    MalformedResponse { provider: Provider, message: String },
}

impl PlatformError {
    /// Errors worth one more attempt after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. }
                | PlatformError::Timeout { .. }
                | PlatformError::Transient { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PlatformError::Auth { .. })
    }

    pub fn provider(&self) -> Provider {
        match self {
            PlatformError::Auth { provider, .. }
            | PlatformError::RateLimited { provider, .. }
            | PlatformError::NotFound { provider, .. }
            | PlatformError::WriteNotSupported { provider }
            | PlatformError::Timeout { provider }
            | PlatformError::Transient { provider, .. }
            | PlatformError::Permanent { provider, .. }
            | PlatformError::MalformedResponse { provider, .. } => *provider,
        }
    }

    /// Stable snake_case tag stored alongside error details.
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::Auth { .. } => "auth_error",
            PlatformError::RateLimited { .. } => "rate_limited",
            PlatformError::NotFound { .. } => "not_found",
            PlatformError::WriteNotSupported { .. } => "write_not_supported",
            PlatformError::Timeout { .. } => "timeout",
            PlatformError::Transient { .. } => "transient",
            PlatformError::Permanent { .. } => "permanent",
            PlatformError::MalformedResponse { .. } => "malformed_response",
        }
    }
}

/// A track as every adapter reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTrack {
    /// Identifier understood by the provider's write endpoints
    pub provider_track_id: String,
    pub title: String,
    /// Primary artists joined with ", "
    pub artist: String,
    pub album: Option<String>,
    /// `None` when the provider does not report a duration
    pub duration_ms: Option<u64>,
    pub isrc: Option<String>,
}

/// Credentials of one connection, decrypted for the duration of a call.
#[derive(Clone)]
pub struct AccessContext {
    pub connection_id: Uuid,
    pub access_token: String,
    pub provider_user_id: Option<String>,
}

impl std::fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessContext")
            .field("connection_id", &self.connection_id)
            .field("access_token", &"***")
            .field("provider_user_id", &self.provider_user_id)
            .finish()
    }
}

/// Result of a refresh-token exchange.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Providers may rotate the refresh token; `None` keeps the old one
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Static capability flags, checked by callers before dispatching writes.
    fn capabilities(&self) -> PlatformCapabilities;

    /// Every track of a playlist, following pagination until exhausted.
    async fn fetch_playlist_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
    ) -> Result<Vec<NormalizedTrack>, PlatformError>;

    /// Best-effort catalog search, in provider ranking order. Empty when
    /// nothing matches.
    async fn search_track(
        &self,
        ctx: &AccessContext,
        query: &str,
        limit: u32,
    ) -> Result<Vec<NormalizedTrack>, PlatformError>;

    /// Exact lookup by ISRC; providers without one return `Ok(None)`.
    async fn search_by_isrc(
        &self,
        _ctx: &AccessContext,
        _isrc: &str,
    ) -> Result<Option<NormalizedTrack>, PlatformError> {
        Ok(None)
    }

    /// Creates a private playlist and returns its provider id.
    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        title: &str,
        description: &str,
    ) -> Result<String, PlatformError>;

    /// Appends tracks, batching to the provider's per-request limit.
    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), PlatformError>;

    async fn remove_tracks(
        &self,
        _ctx: &AccessContext,
        _playlist_id: &str,
        _track_ids: &[String],
    ) -> Result<(), PlatformError> {
        Err(PlatformError::WriteNotSupported {
            provider: self.provider(),
        })
    }

    /// Exchanges a refresh token for a new access token.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError>;
}
