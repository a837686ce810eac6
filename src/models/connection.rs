//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores a user's authorization grant to one streaming platform.

use std::{fmt, str::FromStr};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;

/// Connection entity representing a user's grant to one provider
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Provider slug (see [`Provider`])
    pub provider: String,

    /// Account identifier on the provider side
    pub provider_user_id: Option<String>,

    /// Status of the connection (see [`ConnectionStatus`])
    pub status: String,

    /// Encrypted access token ciphertext
    pub access_token_ciphertext: Option<Vec<u8>>,

    /// Encrypted refresh token ciphertext
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Space separated OAuth scopes granted
    pub scope: Option<String>,

    pub can_read: bool,
    pub can_write: bool,
    pub can_export: bool,

    /// Last time a sync job used this connection
    pub last_used_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn provider(&self) -> Result<Provider, ParseEnumError> {
        self.provider.parse()
    }

    pub fn connection_status(&self) -> Result<ConnectionStatus, ParseEnumError> {
        self.status.parse()
    }
}

/// Streaming platforms the engine can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Spotify,
    AppleMusic,
    Deezer,
    Youtube,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Spotify,
        Provider::AppleMusic,
        Provider::Deezer,
        Provider::Youtube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Spotify => "spotify",
            Provider::AppleMusic => "apple_music",
            Provider::Deezer => "deezer",
            Provider::Youtube => "youtube",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spotify" => Ok(Provider::Spotify),
            "apple_music" => Ok(Provider::AppleMusic),
            "deezer" => Ok(Provider::Deezer),
            "youtube" => Ok(Provider::Youtube),
            other => Err(ParseEnumError::new("provider", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Error,
    Expired,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Expired => "expired",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(ConnectionStatus::Connected),
            "error" => Ok(ConnectionStatus::Error),
            "expired" => Ok(ConnectionStatus::Expired),
            other => Err(ParseEnumError::new("connection status", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_slugs_round_trip() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("tidal".parse::<Provider>().is_err());
    }
}
