//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table.
//! Each row is one execution attempt for a playlist; terminal rows are never
//! reopened.

use std::{fmt, str::FromStr};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::ParseEnumError;
use super::playlist::Entity as Playlist;
use super::sync_log::Entity as SyncLog;

/// SyncJob entity representing one sync run of a playlist
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key)]
    pub id: Uuid,

    /// Playlist this job reconciles
    pub playlist_id: Uuid,

    /// Current status of the job (see [`JobStatus`])
    pub status: String,

    /// Sync mode captured when the job started
    pub sync_mode: String,

    pub tracks_total: i32,
    pub tracks_matched: i32,
    pub tracks_unmatched: i32,
    pub tracks_added: i32,

    /// Timestamp when the job entered `running`
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp of the terminal transition
    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Human readable reason for `failed` or degraded runs
    pub error_message: Option<String>,

    /// Job-level events (destination created, removals, cancellation)
    #[sea_orm(column_type = "JsonBinary")]
    pub logs: JsonValue,

    /// Timestamp when the sync job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the sync job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Playlist",
        from = "Column::PlaylistId",
        to = "super::playlist::Column::Id",
        on_delete = "Cascade"
    )]
    Playlist,
    #[sea_orm(has_many = "SyncLog")]
    SyncLog,
}

impl Related<Playlist> for Entity {
    fn to() -> RelationDef {
        Relation::Playlist.def()
    }
}

impl Related<SyncLog> for Entity {
    fn to() -> RelationDef {
        Relation::SyncLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn job_status(&self) -> Result<JobStatus, ParseEnumError> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Partial
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "partial" => Ok(JobStatus::Partial),
            other => Err(ParseEnumError::new("job status", other)),
        }
    }
}
