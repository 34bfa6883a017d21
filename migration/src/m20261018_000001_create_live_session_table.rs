use sea_orm_migration::prelude::*;

/// Creates the `live_session` table mirrored by the change-feed relay.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(DeriveIden)]
enum LiveSession {
    Table,
    Id,
    HostId,
    Participants,
    State,
    CreatedAt,
    UpdatedAt,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LiveSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LiveSession::Id)
                            .string_len(10)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LiveSession::HostId).string().not_null())
                    .col(ColumnDef::new(LiveSession::Participants).json().not_null())
                    .col(ColumnDef::new(LiveSession::State).json().not_null())
                    .col(
                        ColumnDef::new(LiveSession::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LiveSession::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_live_session_updated_at")
                    .table(LiveSession::Table)
                    .col(LiveSession::UpdatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LiveSession::Table).to_owned())
            .await
    }
}
