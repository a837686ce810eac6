//! Migration to create the sync_logs table (per-track outcomes).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLogs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncLogs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncLogs::SyncJobId).uuid().not_null())
                    .col(ColumnDef::new(SyncLogs::Position).integer().not_null())
                    .col(ColumnDef::new(SyncLogs::SourceTrackId).text().not_null())
                    .col(ColumnDef::new(SyncLogs::SourceTitle).text().not_null())
                    .col(ColumnDef::new(SyncLogs::SourceArtist).text().not_null())
                    .col(ColumnDef::new(SyncLogs::DestTrackId).text().null())
                    .col(ColumnDef::new(SyncLogs::DestTitle).text().null())
                    .col(ColumnDef::new(SyncLogs::DestArtist).text().null())
                    .col(
                        ColumnDef::new(SyncLogs::ConfidenceScore)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(ColumnDef::new(SyncLogs::Status).text().not_null())
                    .col(ColumnDef::new(SyncLogs::ErrorDetails).text().null())
                    .col(
                        ColumnDef::new(SyncLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_logs_sync_job_id")
                            .from(SyncLogs::Table, SyncLogs::SyncJobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One row per source position within a job
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_logs_job_position")
                    .table(SyncLogs::Table)
                    .col(SyncLogs::SyncJobId)
                    .col(SyncLogs::Position)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_logs_job_position").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLogs {
    Table,
    Id,
    SyncJobId,
    Position,
    SourceTrackId,
    SourceTitle,
    SourceArtist,
    DestTrackId,
    DestTitle,
    DestArtist,
    ConfidenceScore,
    Status,
    ErrorDetails,
    CreatedAt,
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
}
