//! SyncLog entity model
//!
//! One immutable row per source track processed by a sync job.

use std::{fmt, str::FromStr};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;
use super::sync_job::Entity as SyncJob;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,

    pub sync_job_id: Uuid,

    /// Zero-based index of the track in the source snapshot
    pub position: i32,

    pub source_track_id: String,
    pub source_title: String,
    pub source_artist: String,

    pub dest_track_id: Option<String>,
    pub dest_title: Option<String>,
    pub dest_artist: Option<String>,

    /// Best confidence seen for this track, in [0, 1]
    pub confidence_score: f64,

    /// See [`TrackStatus`]
    pub status: String,

    pub error_details: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "SyncJob",
        from = "Column::SyncJobId",
        to = "super::sync_job::Column::Id",
        on_delete = "Cascade"
    )]
    SyncJob,
}

impl Related<SyncJob> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Final outcome of one source track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Matched, and already present on the destination (or export only)
    Matched,
    Unmatched,
    WriteFailed,
    Written,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Matched => "matched",
            TrackStatus::Unmatched => "unmatched",
            TrackStatus::WriteFailed => "write_failed",
            TrackStatus::Written => "written",
        }
    }

    /// Whether the track ended up represented on the destination.
    pub fn is_success(&self) -> bool {
        matches!(self, TrackStatus::Matched | TrackStatus::Written)
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matched" => Ok(TrackStatus::Matched),
            "unmatched" => Ok(TrackStatus::Unmatched),
            "write_failed" => Ok(TrackStatus::WriteFailed),
            "written" => Ok(TrackStatus::Written),
            other => Err(ParseEnumError::new("track status", other)),
        }
    }
}
