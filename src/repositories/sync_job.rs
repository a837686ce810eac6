//! # SyncJob Repository
//!
//! Owns the job state machine at the storage level. The partial unique index
//! `idx_sync_jobs_playlist_active` is the per-playlist lock: inserting a
//! second pending job for a playlist fails, and any terminal transition
//! releases it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::playlist::PlaylistRepository;
use crate::error::{SyncError, is_unique_violation};
use crate::models::playlist::SyncMode;
use crate::models::sync_job::{ActiveModel, Column, Entity, JobStatus, Model};

const ACTIVE_STATUSES: [&str; 2] = ["pending", "running"];

/// Track counters written when a job finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub total: i32,
    pub matched: i32,
    pub unmatched: i32,
    pub added: i32,
}

/// Terminal state of a job plus what to record with it.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub counts: JobCounts,
    pub error_message: Option<String>,
    pub logs: JsonValue,
    /// `(playlist_id, next_sync_at)`; set for completed and partial runs
    pub schedule: Option<(Uuid, Option<DateTime<Utc>>)>,
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncJobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Takes the playlist lock by inserting a `pending` job.
    pub async fn insert_pending(
        &self,
        playlist_id: Uuid,
        mode: SyncMode,
        now: DateTime<Utc>,
    ) -> Result<Model, SyncError> {
        let id = Uuid::new_v4();
        let now = now.fixed_offset();
        let job = ActiveModel {
            id: Set(id),
            playlist_id: Set(playlist_id),
            status: Set(JobStatus::Pending.as_str().to_string()),
            sync_mode: Set(mode.as_str().to_string()),
            tracks_total: Set(0),
            tracks_matched: Set(0),
            tracks_unmatched: Set(0),
            tracks_added: Set(0),
            started_at: Set(None),
            completed_at: Set(None),
            error_message: Set(None),
            logs: Set(JsonValue::Array(Vec::new())),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match Entity::insert(job).exec_without_returning(&*self.db).await {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                tracing::debug!(playlist_id = %playlist_id, "Active sync job exists; not starting another");
                return Err(SyncError::AlreadyRunning { playlist_id });
            }
            Err(err) => return Err(err.into()),
        }

        self.require(id).await
    }

    pub async fn mark_running(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Model, SyncError> {
        let now = now.fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(Column::StartedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Pending.as_str()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(SyncError::JobNotFound(job_id));
        }
        self.require(job_id).await
    }

    /// Moves a non-terminal job to its terminal state and, for successful
    /// runs, advances the playlist schedule in the same transaction.
    ///
    /// Returns `false` when the job had already left the active states, for
    /// instance after the stale sweep failed it.
    pub async fn finalize(
        &self,
        job_id: Uuid,
        completion: JobCompletion,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        debug_assert!(completion.status.is_terminal());
        let playlists = PlaylistRepository::new(self.db.clone());
        let at = now.fixed_offset();

        let txn = self.db.begin().await?;
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(completion.status.as_str()))
            .col_expr(Column::TracksTotal, Expr::value(completion.counts.total))
            .col_expr(Column::TracksMatched, Expr::value(completion.counts.matched))
            .col_expr(Column::TracksUnmatched, Expr::value(completion.counts.unmatched))
            .col_expr(Column::TracksAdded, Expr::value(completion.counts.added))
            .col_expr(Column::CompletedAt, Expr::value(Some(at)))
            .col_expr(Column::ErrorMessage, Expr::value(completion.error_message))
            .col_expr(Column::Logs, Expr::value(completion.logs))
            .col_expr(Column::UpdatedAt, Expr::value(at))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(ACTIVE_STATUSES))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            tracing::warn!(job_id = %job_id, "Job already terminal; finalization skipped");
            return Ok(false);
        }

        if let Some((playlist_id, next_sync_at)) = completion.schedule {
            playlists
                .update_schedule(&txn, playlist_id, now, next_sync_at)
                .await?;
        }

        txn.commit().await?;
        Ok(true)
    }

    /// Records progress on an active job so the stale sweep leaves it alone.
    /// Returns `false` once the job is no longer active.
    pub async fn heartbeat(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(ACTIVE_STATUSES))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Fails jobs left active since before `cutoff`, releasing their locks.
    /// Jobs in `live` are owned by a task of this process and never swept.
    pub async fn sweep_stale(&self, cutoff: DateTime<Utc>, live: &[Uuid]) -> Result<u64, DbErr> {
        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(Column::ErrorMessage, Expr::value(Some("abandoned".to_string())))
            .col_expr(Column::CompletedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.is_in(ACTIVE_STATUSES))
            .filter(Column::UpdatedAt.lt(cutoff.fixed_offset()));
        if !live.is_empty() {
            update = update.filter(Column::Id.is_not_in(live.iter().copied()));
        }
        let result = update.exec(&*self.db).await?;
        Ok(result.rows_affected)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(job_id).one(&*self.db).await?)
    }

    pub async fn require(&self, job_id: Uuid) -> Result<Model, SyncError> {
        self.get(job_id).await?.ok_or(SyncError::JobNotFound(job_id))
    }

    /// Jobs of a playlist, newest first.
    pub async fn list_for_playlist(&self, playlist_id: Uuid) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::PlaylistId.eq(playlist_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .all(&*self.db)
            .await?)
    }

    pub async fn active_for_playlist(&self, playlist_id: Uuid) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::PlaylistId.eq(playlist_id))
            .filter(Column::Status.is_in(ACTIVE_STATUSES))
            .one(&*self.db)
            .await?)
    }
}
