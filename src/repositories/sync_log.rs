//! SyncLog repository. Rows are append-only.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::sync_log::{ActiveModel, Column, Entity, Model, TrackStatus};

/// One per-track outcome ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncLog {
    pub position: i32,
    pub source_track_id: String,
    pub source_title: String,
    pub source_artist: String,
    pub dest_track_id: Option<String>,
    pub dest_title: Option<String>,
    pub dest_artist: Option<String>,
    pub confidence_score: f64,
    pub status: TrackStatus,
    pub error_details: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncLogRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn append(&self, job_id: Uuid, entry: NewSyncLog) -> Result<(), SyncError> {
        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            sync_job_id: Set(job_id),
            position: Set(entry.position),
            source_track_id: Set(entry.source_track_id),
            source_title: Set(entry.source_title),
            source_artist: Set(entry.source_artist),
            dest_track_id: Set(entry.dest_track_id),
            dest_title: Set(entry.dest_title),
            dest_artist: Set(entry.dest_artist),
            confidence_score: Set(entry.confidence_score.clamp(0.0, 1.0)),
            status: Set(entry.status.as_str().to_string()),
            error_details: Set(entry.error_details),
            created_at: Set(Utc::now().fixed_offset()),
        };
        Entity::insert(row).exec_without_returning(&*self.db).await?;
        Ok(())
    }

    /// Logs of a job in source order.
    pub async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::SyncJobId.eq(job_id))
            .order_by_asc(Column::Position)
            .all(&*self.db)
            .await?)
    }
}
