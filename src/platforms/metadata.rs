//! Platform metadata types
//!
//! Capability flags and paging constants for each provider.

use serde::{Deserialize, Serialize};

use crate::models::connection::Provider;

/// Authentication type used by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// OAuth 2.0 bearer token with refresh support
    OAuth2,
    /// Developer token plus a per-user token, no refresh
    DeveloperToken,
    /// Long-lived token passed as a query parameter
    QueryToken,
}

/// What an adapter can do, plus its variant-specific paging constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_export: bool,
    /// Supports removing tracks (needed by mirror mode)
    pub can_remove: bool,
    /// Maximum items per add/remove request
    pub write_batch_size: usize,
    /// Page size used while fetching playlist tracks
    pub page_size: usize,
}

impl PlatformCapabilities {
    pub fn read_only(page_size: usize) -> Self {
        Self {
            can_read: true,
            can_write: false,
            can_export: true,
            can_remove: false,
            write_batch_size: 0,
            page_size,
        }
    }

    /// Lowers the paging constants to configured values. Sizes never exceed
    /// the provider maximum and never drop below one item; adapters that
    /// cannot write keep a zero batch size.
    pub fn with_limits(mut self, page_size: Option<usize>, write_batch_size: Option<usize>) -> Self {
        if let Some(size) = page_size {
            self.page_size = size.clamp(1, self.page_size);
        }
        if let (Some(size), true) = (write_batch_size, self.write_batch_size > 0) {
            self.write_batch_size = size.clamp(1, self.write_batch_size);
        }
        self
    }
}

/// Metadata about a registered platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub provider: Provider,
    pub auth_type: AuthType,
    /// OAuth scopes the connection needs for read and write
    pub scopes: Vec<String>,
    pub capabilities: PlatformCapabilities,
}

impl PlatformMetadata {
    pub fn new(
        provider: Provider,
        auth_type: AuthType,
        scopes: Vec<String>,
        capabilities: PlatformCapabilities,
    ) -> Self {
        Self {
            provider,
            auth_type,
            scopes,
            capabilities,
        }
    }
}
