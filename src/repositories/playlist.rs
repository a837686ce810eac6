//! Playlist repository

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::connection::{ConnectionStatus, Model as ConnectionModel, Provider};
use crate::models::playlist::{self, ActiveModel, Entity as Playlist, Model, SyncFrequency, SyncMode};
use crate::platforms::PlatformCapabilities;

/// Input for [`PlaylistRepository::create`].
#[derive(Debug, Clone)]
pub struct NewPlaylist {
    pub user_id: Uuid,
    pub name: String,
    pub source_connection_id: Uuid,
    pub source_playlist_id: String,
    pub destination_connection_id: Uuid,
    pub destination_playlist_id: Option<String>,
    pub sync_mode: SyncMode,
    pub sync_frequency: SyncFrequency,
}

/// Checks the pairing rules a playlist must satisfy before it is stored.
pub fn validate_pairing(
    input: &NewPlaylist,
    source: &ConnectionModel,
    destination: &ConnectionModel,
    destination_capabilities: &PlatformCapabilities,
) -> Result<(), SyncError> {
    for connection in [source, destination] {
        if connection.user_id != input.user_id {
            return Err(SyncError::InvalidPlaylist(format!(
                "connection {} belongs to another user",
                connection.id
            )));
        }
        if connection.connection_status()? == ConnectionStatus::Expired {
            return Err(SyncError::ConnectionExpired {
                connection_id: connection.id,
            });
        }
    }

    if !source.can_read {
        return Err(SyncError::InvalidPlaylist(format!(
            "source connection {} cannot read",
            source.id
        )));
    }

    let destination_writes = destination.can_write && destination_capabilities.can_write;
    if !destination_writes && input.sync_mode != SyncMode::ExportOnly {
        return Err(SyncError::InvalidPlaylist(format!(
            "destination {} cannot write; only export_only is permitted",
            destination.provider
        )));
    }

    if input.sync_mode == SyncMode::Mirror && !destination_capabilities.can_remove {
        tracing::warn!(
            destination = %destination.provider,
            "Mirror mode on a destination without removal support; removals will be skipped"
        );
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct PlaylistRepository {
    pub db: Arc<DatabaseConnection>,
}

impl PlaylistRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Validates the connection pairing and stores the playlist. Recurring
    /// playlists start with no `next_sync_at`, which makes them due at once.
    pub async fn create(
        &self,
        input: NewPlaylist,
        source: &ConnectionModel,
        destination: &ConnectionModel,
        destination_capabilities: &PlatformCapabilities,
    ) -> Result<Model, SyncError> {
        validate_pairing(&input, source, destination, destination_capabilities)?;

        let source_platform: Provider = source.provider()?;
        let destination_platform: Provider = destination.provider()?;
        let id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();

        let model = ActiveModel {
            id: Set(id),
            user_id: Set(input.user_id),
            name: Set(input.name),
            source_platform: Set(source_platform.as_str().to_string()),
            source_playlist_id: Set(input.source_playlist_id),
            source_connection_id: Set(source.id),
            destination_platform: Set(destination_platform.as_str().to_string()),
            destination_playlist_id: Set(input.destination_playlist_id),
            destination_connection_id: Set(destination.id),
            sync_mode: Set(input.sync_mode.as_str().to_string()),
            sync_frequency: Set(input.sync_frequency.as_str().to_string()),
            is_active: Set(true),
            last_synced_at: Set(None),
            next_sync_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Playlist::insert(model)
            .exec_without_returning(&*self.db)
            .await?;

        self.require(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Model>, SyncError> {
        Ok(Playlist::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn require(&self, id: Uuid) -> Result<Model, SyncError> {
        self.get(id).await?.ok_or(SyncError::PlaylistNotFound(id))
    }

    /// Active recurring playlists whose next run is due, oldest first.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Model>, SyncError> {
        Ok(Playlist::find()
            .filter(playlist::Column::IsActive.eq(true))
            .filter(playlist::Column::SyncFrequency.ne(SyncFrequency::Manual.as_str()))
            .filter(
                Condition::any()
                    .add(playlist::Column::NextSyncAt.is_null())
                    .add(playlist::Column::NextSyncAt.lte(now.fixed_offset())),
            )
            .order_by_asc(playlist::Column::NextSyncAt)
            .order_by_asc(playlist::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Stops future runs; the row and its history are kept.
    pub async fn deactivate(&self, id: Uuid) -> Result<Model, SyncError> {
        let result = Playlist::update_many()
            .col_expr(playlist::Column::IsActive, Expr::value(false))
            .col_expr(
                playlist::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(playlist::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(SyncError::PlaylistNotFound(id));
        }
        self.require(id).await
    }

    pub async fn set_destination_playlist_id(
        &self,
        id: Uuid,
        destination_playlist_id: &str,
    ) -> Result<(), SyncError> {
        Playlist::update_many()
            .col_expr(
                playlist::Column::DestinationPlaylistId,
                Expr::value(Some(destination_playlist_id.to_string())),
            )
            .col_expr(
                playlist::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(playlist::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Records a finished run. Called inside the job finalization
    /// transaction.
    pub async fn update_schedule<C>(
        &self,
        conn: &C,
        id: Uuid,
        last_synced_at: DateTime<Utc>,
        next_sync_at: Option<DateTime<Utc>>,
    ) -> Result<(), SyncError>
    where
        C: ConnectionTrait,
    {
        Playlist::update_many()
            .col_expr(
                playlist::Column::LastSyncedAt,
                Expr::value(Some(last_synced_at.fixed_offset())),
            )
            .col_expr(
                playlist::Column::NextSyncAt,
                Expr::value(next_sync_at.map(|t| t.fixed_offset())),
            )
            .col_expr(
                playlist::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(playlist::Column::Id.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }
}
