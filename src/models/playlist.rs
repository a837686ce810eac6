//! Playlist entity model
//!
//! A playlist row is a sync configuration: where tracks come from, where they
//! go, and how often the two sides are reconciled.

use std::{fmt, str::FromStr};

use chrono::Duration;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;
use super::sync_job::Entity as SyncJob;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "playlists")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,

    pub user_id: Uuid,

    /// Display name, also used as the title of a created destination playlist
    pub name: String,

    pub source_platform: String,
    pub source_playlist_id: String,
    pub source_connection_id: Uuid,

    pub destination_platform: String,
    /// Provider playlist id; `None` until the first run creates it
    pub destination_playlist_id: Option<String>,
    pub destination_connection_id: Uuid,

    /// See [`SyncMode`]
    pub sync_mode: String,

    /// See [`SyncFrequency`]
    pub sync_frequency: String,

    /// Deactivated playlists are never deleted, only skipped
    pub is_active: bool,

    pub last_synced_at: Option<DateTimeWithTimeZone>,
    pub next_sync_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "SyncJob")]
    SyncJob,
}

impl Related<SyncJob> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn mode(&self) -> Result<SyncMode, ParseEnumError> {
        self.sync_mode.parse()
    }

    pub fn frequency(&self) -> Result<SyncFrequency, ParseEnumError> {
        self.sync_frequency.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only add tracks missing on the destination
    AddOnly,
    /// Add missing tracks and remove tracks absent from the source
    Mirror,
    /// Match tracks and record the result without writing
    ExportOnly,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::AddOnly => "add_only",
            SyncMode::Mirror => "mirror",
            SyncMode::ExportOnly => "export_only",
        }
    }

    pub fn writes(&self) -> bool {
        !matches!(self, SyncMode::ExportOnly)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add_only" => Ok(SyncMode::AddOnly),
            "mirror" => Ok(SyncMode::Mirror),
            "export_only" => Ok(SyncMode::ExportOnly),
            other => Err(ParseEnumError::new("sync mode", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    Manual,
    Daily,
    Weekly,
}

impl SyncFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFrequency::Manual => "manual",
            SyncFrequency::Daily => "daily",
            SyncFrequency::Weekly => "weekly",
        }
    }

    /// Interval between recurring runs; `None` for manual playlists.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncFrequency::Manual => None,
            SyncFrequency::Daily => Some(Duration::days(1)),
            SyncFrequency::Weekly => Some(Duration::days(7)),
        }
    }
}

impl FromStr for SyncFrequency {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SyncFrequency::Manual),
            "daily" => Ok(SyncFrequency::Daily),
            "weekly" => Ok(SyncFrequency::Weekly),
            other => Err(ParseEnumError::new("sync frequency", other)),
        }
    }
}
