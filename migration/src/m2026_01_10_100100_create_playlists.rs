//! Migration to create the playlists table (sync configurations).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Playlists::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Playlists::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Playlists::UserId).uuid().not_null())
                    .col(ColumnDef::new(Playlists::Name).text().not_null())
                    .col(ColumnDef::new(Playlists::SourcePlatform).text().not_null())
                    .col(ColumnDef::new(Playlists::SourcePlaylistId).text().not_null())
                    .col(ColumnDef::new(Playlists::SourceConnectionId).uuid().not_null())
                    .col(
                        ColumnDef::new(Playlists::DestinationPlatform)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Playlists::DestinationPlaylistId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Playlists::DestinationConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Playlists::SyncMode)
                            .text()
                            .not_null()
                            .default("add_only"),
                    )
                    .col(
                        ColumnDef::new(Playlists::SyncFrequency)
                            .text()
                            .not_null()
                            .default("manual"),
                    )
                    .col(
                        ColumnDef::new(Playlists::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Playlists::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Playlists::NextSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Playlists::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Playlists::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_playlists_source_connection_id")
                            .from(Playlists::Table, Playlists::SourceConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_playlists_destination_connection_id")
                            .from(Playlists::Table, Playlists::DestinationConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // Dispatcher scan: active recurring playlists ordered by due time
        manager
            .create_index(
                Index::create()
                    .name("idx_playlists_active_next_sync")
                    .table(Playlists::Table)
                    .col(Playlists::IsActive)
                    .col(Playlists::NextSyncAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_playlists_user_id")
                    .table(Playlists::Table)
                    .col(Playlists::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_playlists_active_next_sync")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_playlists_user_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Playlists::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Playlists {
    Table,
    Id,
    UserId,
    Name,
    SourcePlatform,
    SourcePlaylistId,
    SourceConnectionId,
    DestinationPlatform,
    DestinationPlaylistId,
    DestinationConnectionId,
    SyncMode,
    SyncFrequency,
    IsActive,
    LastSyncedAt,
    NextSyncAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
